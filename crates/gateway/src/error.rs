use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Map, Value};

/// HTTP-facing failure of a gateway handler.
///
/// Rendered as `{"error": "<code>", "message": "<text>", ...details}`.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{code}: {message}")]
    BadRequest { code: &'static str, message: String },
    #[error("{code}: {message}")]
    NotFound {
        code: &'static str,
        message: String,
        details: Map<String, Value>,
    },
    #[error("{code}: {message}")]
    Upstream {
        code: &'static str,
        message: String,
        details: Map<String, Value>,
    },
    #[error("{code}: {message}")]
    Internal { code: &'static str, message: String },
    /// Request body that is not the expected JSON (or exceeds the body limit).
    #[error("invalid body: {0}")]
    InvalidBody(#[from] JsonRejection),
}

impl GatewayError {
    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::BadRequest {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::NotFound {
            code,
            message: message.into(),
            details: Map::new(),
        }
    }

    pub fn upstream(code: &'static str, message: impl Into<String>) -> Self {
        Self::Upstream {
            code,
            message: message.into(),
            details: Map::new(),
        }
    }

    pub fn internal(code: &'static str, message: impl Into<String>) -> Self {
        Self::Internal {
            code,
            message: message.into(),
        }
    }

    /// Attach an extra top-level field to the JSON body (only kept on 404/502 errors).
    #[must_use]
    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        if let Self::NotFound { details, .. } | Self::Upstream { details, .. } = &mut self {
            details.insert(key.to_string(), value.into());
        }
        self
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest { code, .. }
            | Self::NotFound { code, .. }
            | Self::Upstream { code, .. }
            | Self::Internal { code, .. } => code,
            Self::InvalidBody(r) if r.status() == StatusCode::PAYLOAD_TOO_LARGE => {
                "payload_too_large"
            }
            Self::InvalidBody(_) => "invalid_body",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::InvalidBody(r) => r.status(),
        }
    }
}

/// Map an `anyhow` failure into a 500 with the given code, logging the full chain.
pub fn internal_error(code: &'static str) -> impl FnOnce(anyhow::Error) -> GatewayError {
    move |e| {
        tracing::error!(error = ?e, "internal error ({code})");
        GatewayError::internal(code, format!("{e:#}"))
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let (message, details) = match self {
            Self::BadRequest { message, .. } | Self::Internal { message, .. } => {
                (message, Map::new())
            }
            Self::NotFound {
                message, details, ..
            }
            | Self::Upstream {
                message, details, ..
            } => (message, details),
            Self::InvalidBody(r) => (r.body_text(), Map::new()),
        };

        if status == StatusCode::BAD_GATEWAY {
            tracing::warn!(code, %message, "upstream failure");
        }

        let mut body = Map::new();
        body.insert("error".to_string(), Value::from(code));
        body.insert("message".to_string(), Value::from(message));
        body.extend(details);
        (status, Json(Value::Object(body))).into_response()
    }
}
