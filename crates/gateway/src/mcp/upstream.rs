use async_trait::async_trait;
use axum::http::HeaderMap;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use serde_json::{Value, json};

pub(crate) const HEADER_SESSION_ID: &str = "mcp-session-id";
pub(crate) const HEADER_SESSION_ID_ALT: &str = "x-mcp-session-id";
/// `Access-Control-Expose-Headers` value for responses that carry a session id.
pub(crate) const EXPOSE_SESSION_HEADERS: &str = "mcp-session-id, x-mcp-session-id";
pub(crate) const PROTOCOL_VERSION: &str = "2025-03-26";
const JSON_MIME_TYPE: &str = "application/json";
const ACCEPT_JSON_OR_SSE: &str = "application/json, text/event-stream";

/// Session id from either header spelling (header lookup is case-insensitive).
pub(crate) fn session_id_from_headers(headers: &HeaderMap) -> Option<String> {
    [HEADER_SESSION_ID, HEADER_SESSION_ID_ALT]
        .into_iter()
        .filter_map(|name| headers.get(name))
        .filter_map(|v| v.to_str().ok())
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// One upstream round trip.
#[derive(Debug, Clone)]
pub(crate) struct CallAttempt {
    pub text: String,
    /// Parsed JSON-RPC envelope; `None` when the body is neither a JSON object nor an event
    /// stream carrying one.
    pub envelope: Option<Value>,
    pub headers: HeaderMap,
}

impl CallAttempt {
    pub fn new(text: String, headers: HeaderMap) -> Self {
        let envelope = parse_envelope(&text);
        Self {
            text,
            envelope,
            headers,
        }
    }

    pub fn session_id(&self) -> Option<String> {
        session_id_from_headers(&self.headers)
    }
}

fn parse_envelope(text: &str) -> Option<Value> {
    if let Ok(v @ Value::Object(_)) = serde_json::from_str::<Value>(text) {
        return Some(v);
    }
    // Streamable HTTP servers may answer with an event stream; take the first JSON payload.
    text.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
        .filter(|data| !data.is_empty())
        .find_map(|data| match serde_json::from_str::<Value>(data) {
            Ok(v @ Value::Object(_)) => Some(v),
            _ => None,
        })
}

/// Posts JSON-RPC payloads to one upstream MCP endpoint.
#[async_trait]
pub(crate) trait RpcTransport: Send + Sync {
    async fn post(&self, payload: &Value, session_id: Option<&str>)
    -> anyhow::Result<CallAttempt>;
}

pub(crate) struct UpstreamClient {
    http: reqwest::Client,
    url: String,
    auth: Option<HeaderValue>,
}

impl UpstreamClient {
    pub fn new(http: reqwest::Client, url: String, auth: Option<HeaderValue>) -> Self {
        Self { http, url, auth }
    }
}

#[async_trait]
impl RpcTransport for UpstreamClient {
    async fn post(
        &self,
        payload: &Value,
        session_id: Option<&str>,
    ) -> anyhow::Result<CallAttempt> {
        let mut req = self
            .http
            .post(&self.url)
            .header(CONTENT_TYPE, JSON_MIME_TYPE)
            .header(ACCEPT, ACCEPT_JSON_OR_SSE)
            .body(serde_json::to_vec(payload)?);
        if let Some(auth) = &self.auth {
            req = req.header(AUTHORIZATION, auth.clone());
        }
        if let Some(sid) = session_id {
            req = req.header(HEADER_SESSION_ID, sid);
        }
        let resp = req.send().await?;
        let headers = resp.headers().clone();
        let text = resp.text().await?;
        Ok(CallAttempt::new(text, headers))
    }
}

/// Best-effort `initialize` against the upstream.
///
/// Returns the upstream's session id, else the inbound one. A transport failure yields `None`;
/// there is no retry.
pub(crate) async fn ensure_session<T: RpcTransport + ?Sized>(
    transport: &T,
    inbound_session: Option<&str>,
) -> Option<String> {
    let payload = json!({
        "jsonrpc": "2.0",
        "id": now_millis(),
        "method": "initialize",
        "params": {
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": { "name": "devgw", "version": env!("CARGO_PKG_VERSION") }
        }
    });

    let attempt = match transport.post(&payload, inbound_session).await {
        Ok(a) => a,
        Err(e) => {
            tracing::warn!(error = %e, "upstream initialize failed");
            return None;
        }
    };

    let Some(upstream_session) = attempt.session_id() else {
        return inbound_session.map(str::to_string);
    };

    if inbound_session != Some(upstream_session.as_str()) {
        // Some servers treat the session as pending until the client confirms the handshake.
        let initialized = json!({ "jsonrpc": "2.0", "method": "notifications/initialized" });
        if let Err(e) = transport
            .post(&initialized, Some(upstream_session.as_str()))
            .await
        {
            tracing::debug!(error = %e, "notifications/initialized failed");
        }
    }
    Some(upstream_session)
}

/// Upstream tool names from `tools/list`; `None` means discovery is unavailable, which is
/// different from an empty tool list.
pub(crate) async fn list_tools<T: RpcTransport + ?Sized>(
    transport: &T,
    session_id: Option<&str>,
) -> Option<Vec<String>> {
    let payload = json!({
        "jsonrpc": "2.0",
        "id": now_millis(),
        "method": "tools/list",
        "params": {}
    });
    let attempt = match transport.post(&payload, session_id).await {
        Ok(a) => a,
        Err(e) => {
            tracing::debug!(error = %e, "tools/list transport failed");
            return None;
        }
    };
    let tools = attempt
        .envelope
        .as_ref()?
        .pointer("/result/tools")?
        .as_array()?;
    Some(
        tools
            .iter()
            .filter_map(|t| t.get("name").and_then(Value::as_str))
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .collect(),
    )
}
