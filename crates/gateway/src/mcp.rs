//! MCP tool-name bridge.
//!
//! Inbound `tools/call` requests that use a product's alias tool names are translated into
//! whatever the upstream actually exposes. Requests the bridge cannot settle fall through to the
//! generic MCP proxy unchanged.

use crate::http::AppState;
use crate::proxy;
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, Uri, header},
    response::{IntoResponse as _, Response},
    routing::{MethodRouter, post},
};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::Instrument as _;

mod candidates;
pub(crate) mod products;
mod synthetic;
mod tool_call;
mod upstream;

pub(crate) use products::{BridgeProduct, builtin_products, validate_products};
pub(crate) use upstream::{HEADER_SESSION_ID, HEADER_SESSION_ID_ALT};
use upstream::EXPOSE_SESSION_HEADERS;

use candidates::resolve_candidates;
use products::Operation;
use tool_call::{DispatchOutcome, DispatchRequest, dispatch};
use upstream::{UpstreamClient, now_millis};

/// Routes for every product path. Non-`POST` methods fall through to the generic MCP proxy.
///
/// Sub-paths below a product path only get the synthetic `tools/list`.
pub(crate) fn bridge_routes(products: &[BridgeProduct]) -> Router<Arc<AppState>> {
    let mut router = Router::new();
    for product in products {
        let product = Arc::new(product.clone());
        for path in &product.paths {
            router = router.route(path, product_route(product.clone(), true));
        }
        for path in &product.synthetic_paths {
            router = router.route(path, product_route(product.clone(), false));
        }
        for path in product.paths.iter().chain(&product.synthetic_paths) {
            let nested = format!("{}/{{*rest}}", path.trim_end_matches('/'));
            router = router.route(&nested, product_route(product.clone(), false));
        }
    }
    router
}

fn product_route(product: Arc<BridgeProduct>, bridged: bool) -> MethodRouter<Arc<AppState>> {
    post(
        move |State(state): State<Arc<AppState>>, uri: Uri, headers: HeaderMap, body: Bytes| {
            let product = product.clone();
            async move { post_product(&state, &product, bridged, &uri, headers, body).await }
        },
    )
    .fallback(proxy::mcp_passthrough)
}

async fn post_product(
    state: &AppState,
    product: &BridgeProduct,
    bridged: bool,
    uri: &Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(resp) = synthetic::respond(product, &headers, &body) {
        return resp;
    }
    if bridged
        && let Some(request) = BridgeRequest::parse(product, &headers, &body)
    {
        let span = tracing::info_span!(
            "devgw.bridge",
            product = %product.name,
            operation = request.operation.suffix(),
        );
        if let Some(resp) = bridge(state, product, uri, &headers, request)
            .instrument(span)
            .await
        {
            return resp;
        }
    }
    proxy::forward_mcp(state, axum::http::Method::POST, uri, headers, body).await
}

/// One inbound bridge call, extracted from the JSON-RPC envelope.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BridgeRequest {
    pub operation: Operation,
    pub arguments: Value,
    /// `None` when the inbound id was absent or `null`.
    pub rpc_id: Option<Value>,
    pub session_id: Option<String>,
    /// Header name the caller used for its session id; echoed on the response.
    pub session_header: &'static str,
}

impl BridgeRequest {
    /// `None` unless this is a `tools/call` for one of the product's alias names.
    pub(crate) fn parse(product: &BridgeProduct, headers: &HeaderMap, body: &[u8]) -> Option<Self> {
        let envelope: Value = serde_json::from_slice(body).ok()?;
        if envelope.get("method").and_then(Value::as_str) != Some("tools/call") {
            return None;
        }
        let params = envelope.get("params")?;
        let name = params.get("name").and_then(Value::as_str)?;
        let operation = product.recognize(name)?;

        let arguments = match params.get("arguments") {
            None | Some(Value::Null) => json!({}),
            Some(v) => v.clone(),
        };
        let rpc_id = envelope.get("id").filter(|v| !v.is_null()).cloned();
        let session_header = if headers.contains_key(HEADER_SESSION_ID) {
            HEADER_SESSION_ID
        } else if headers.contains_key(HEADER_SESSION_ID_ALT) {
            HEADER_SESSION_ID_ALT
        } else {
            HEADER_SESSION_ID
        };

        Some(Self {
            operation,
            arguments,
            rpc_id,
            session_id: upstream::session_id_from_headers(headers),
            session_header,
        })
    }
}

/// Value of a query parameter (percent-decoded).
pub(crate) fn query_param(uri: &Uri, name: &str) -> Option<String> {
    let query = uri.query()?;
    let url = reqwest::Url::parse(&format!("http://localhost/?{query}")).ok()?;
    url.query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

/// Upstream path for a bridged request: the inbound path and query with `/mcp` removed.
fn upstream_path(uri: &Uri) -> String {
    let path_and_query = uri
        .path_and_query()
        .map_or_else(|| uri.path(), |pq| pq.as_str());
    match path_and_query.strip_prefix("/mcp") {
        Some(rest) if rest.is_empty() || rest.starts_with('/') || rest.starts_with('?') => {
            rest.to_string()
        }
        _ => path_and_query.to_string(),
    }
}

/// `None` means the bridge gave up and the caller should fall through to the generic proxy.
async fn bridge(
    state: &AppState,
    product: &BridgeProduct,
    uri: &Uri,
    headers: &HeaderMap,
    request: BridgeRequest,
) -> Option<Response> {
    let Some(base) = state.config.upstream_base() else {
        tracing::warn!("upstream host is not configured; skipping bridge");
        return None;
    };
    let auth = headers
        .get(header::AUTHORIZATION)
        .cloned()
        .or_else(|| state.config.default_auth_header());
    let client = UpstreamClient::new(
        state.http.clone(),
        format!("{base}{}", upstream_path(uri)),
        auth,
    );

    let op = request.operation;
    let override_name = query_param(uri, op.override_param())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let session_id = upstream::ensure_session(&client, request.session_id.as_deref()).await;
    let discovered = match override_name {
        Some(_) => None,
        None => upstream::list_tools(&client, session_id.as_deref()).await,
    };
    let candidates = resolve_candidates(
        op,
        discovered.as_deref(),
        override_name.as_deref(),
        product.fallbacks.for_operation(op),
    );
    tracing::debug!(
        source = ?candidates.source,
        candidates = ?candidates.names,
        has_session = session_id.is_some(),
        "resolved bridge candidates"
    );

    let rpc_id = request
        .rpc_id
        .clone()
        .unwrap_or_else(|| Value::from(now_millis()));
    let outcome = dispatch(
        &client,
        DispatchRequest {
            candidates: &candidates.names,
            arguments: &request.arguments,
            rpc_id: &rpc_id,
            session_id,
        },
    )
    .await;

    match outcome {
        DispatchOutcome::Respond {
            envelope,
            session_id,
        } => Some(bridge_response(
            envelope,
            session_id.as_deref(),
            request.session_header,
        )),
        DispatchOutcome::Exhausted { last_error } => {
            tracing::warn!(
                candidates = candidates.names.len(),
                last = %last_error,
                "all bridge candidates failed; falling through to MCP proxy"
            );
            None
        }
    }
}

fn bridge_response(envelope: Value, session_id: Option<&str>, session_header: &'static str) -> Response {
    let mut resp = (StatusCode::OK, Json(envelope)).into_response();
    let out = resp.headers_mut();
    out.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    out.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static(EXPOSE_SESSION_HEADERS),
    );
    if let Some(sid) = session_id
        && let Ok(v) = HeaderValue::from_str(sid)
    {
        out.insert(session_header, v);
    }
    resp
}
