//! Locally fabricated `tools/list` for bridged products.

use super::products::{BridgeProduct, Operation, ToolSchemaKind};
use super::upstream::{EXPOSE_SESSION_HEADERS, HEADER_SESSION_ID, session_id_from_headers};
use axum::{
    Json,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse as _, Response},
};
use rmcp::model::{JsonObject, Tool};
use serde_json::{Value, json};
use std::sync::Arc;

fn schema(value: Value) -> Arc<JsonObject> {
    match value {
        Value::Object(map) => Arc::new(map),
        _ => Arc::new(JsonObject::new()),
    }
}

fn request_id_schema() -> Arc<JsonObject> {
    schema(json!({
        "type": "object",
        "properties": { "request_id": { "type": "string" } },
        "required": ["request_id"]
    }))
}

fn submit_tool(product: &BridgeProduct) -> Tool {
    let name = product.tool_name(Operation::Submit);
    match product.schema {
        ToolSchemaKind::ImageEdit => Tool::new(
            name,
            "Submit an edit job with prompt and input image URLs",
            schema(json!({
                "type": "object",
                "properties": {
                    "prompt": { "type": "string", "description": "Edit instruction in natural language" },
                    "image_urls": {
                        "type": "array",
                        "items": { "type": "string", "format": "uri" },
                        "minItems": 1
                    },
                    "num_images": { "type": "integer", "minimum": 1, "default": 1 }
                },
                "required": ["prompt", "image_urls"]
            })),
        ),
        ToolSchemaKind::Video => Tool::new(
            name,
            "Submit a video generation job with a prompt and an input image URL.",
            schema(json!({
                "type": "object",
                "properties": {
                    "prompt": { "type": "string", "description": "Animation instruction in natural language" },
                    "image_url": {
                        "type": "string",
                        "format": "uri",
                        "description": "The source image to animate."
                    },
                    "duration_seconds": {
                        "type": "number",
                        "description": "Optional duration of the video in seconds."
                    }
                },
                "required": ["prompt", "image_url"]
            })),
        ),
    }
}

pub(crate) fn product_tools(product: &BridgeProduct) -> Vec<Tool> {
    vec![
        submit_tool(product),
        Tool::new(
            product.tool_name(Operation::Status),
            "Check job status by request_id",
            request_id_schema(),
        ),
        Tool::new(
            product.tool_name(Operation::Result),
            "Get job result by request_id",
            request_id_schema(),
        ),
    ]
}

fn is_json_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|h| h.to_str().ok())
        .is_some_and(|ct| ct.trim().to_ascii_lowercase().starts_with("application/json"))
}

/// Answer `tools/list` locally; `None` for anything else.
pub(crate) fn respond(product: &BridgeProduct, headers: &HeaderMap, body: &[u8]) -> Option<Response> {
    if !is_json_content_type(headers) {
        return None;
    }
    let envelope: Value = serde_json::from_slice(body).ok()?;
    if envelope.get("method").and_then(Value::as_str) != Some("tools/list") {
        return None;
    }

    let id = envelope.get("id").cloned().unwrap_or(Value::Null);
    let payload = json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": { "tools": product_tools(product) }
    });
    tracing::debug!(product = %product.name, "answered tools/list locally");

    let mut resp = (StatusCode::OK, Json(payload)).into_response();
    let out = resp.headers_mut();
    out.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    out.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static(EXPOSE_SESSION_HEADERS),
    );
    if let Some(sid) = session_id_from_headers(headers)
        && let Ok(v) = HeaderValue::from_str(&sid)
    {
        out.insert(HEADER_SESSION_ID, v);
    }
    Some(resp)
}
