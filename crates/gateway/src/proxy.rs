//! Reverse proxies to the upstream MCP host and the local backend.

use crate::error::GatewayError;
use crate::http::AppState;
use crate::mcp::query_param;
use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tower::ServiceExt as _;
use tower_http::services::ServeDir;

/// Paths outside `/mcp` that clients use when their base URL omits the `/mcp` prefix.
pub(crate) const MCP_PATH_PREFIXES: &[&str] = &[
    "/t2i",
    "/i2i",
    "/i2v",
    "/v2v",
    "/r2v",
    "/t2s",
    "/t2m",
    "/v2a",
    "/train",
    "/uploader",
    "/video-analysis",
    "/requirement",
    "/storyboard",
];

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const SSE_EXPOSE_HEADERS: &str = "mcp-session-id, x-mcp-session-id, x-request-id";

/// CORS headers stamped onto proxied responses.
#[derive(Debug)]
pub(crate) struct CorsPolicy {
    allow_headers: &'static str,
    expose_headers: &'static str,
    allow_methods: &'static str,
}

pub(crate) const MCP_CORS: CorsPolicy = CorsPolicy {
    allow_headers: "Content-Type, Authorization, mcp-session-id",
    expose_headers: "mcp-session-id, x-mcp-session-id, mcp-session, x-session-id",
    allow_methods: "GET,POST,OPTIONS",
};

pub(crate) const FALLBACK_CORS: CorsPolicy = CorsPolicy {
    allow_headers: "Content-Type, Authorization, mcp-session-id",
    expose_headers: SSE_EXPOSE_HEADERS,
    allow_methods: "GET,POST,PUT,PATCH,DELETE,OPTIONS",
};

pub(crate) const REST_CORS: CorsPolicy = CorsPolicy {
    allow_headers: "Content-Type, Authorization",
    expose_headers: "*",
    allow_methods: "GET,POST,PUT,PATCH,DELETE,OPTIONS",
};

impl CorsPolicy {
    fn apply(&self, headers: &mut HeaderMap) {
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static(self.allow_headers),
        );
        headers.insert(
            header::ACCESS_CONTROL_EXPOSE_HEADERS,
            HeaderValue::from_static(self.expose_headers),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(self.allow_methods),
        );
    }
}

/// How one proxied request is rewritten.
struct ProxyRoute {
    label: &'static str,
    url: String,
    cors: Option<&'static CorsPolicy>,
    /// Sent as `Authorization` when the caller sent none.
    default_auth: Option<HeaderValue>,
    /// Forward `origin`/`referer` (the backend proxy does).
    keep_client_origin: bool,
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

fn outbound_headers(mut headers: HeaderMap, route: &ProxyRoute) -> HeaderMap {
    for name in [header::HOST, header::CONTENT_LENGTH] {
        headers.remove(name);
    }
    if !route.keep_client_origin {
        headers.remove(header::ORIGIN);
        headers.remove(header::REFERER);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
    if !headers.contains_key(header::AUTHORIZATION)
        && let Some(auth) = &route.default_auth
    {
        headers.insert(header::AUTHORIZATION, auth.clone());
    }
    headers
}

async fn forward(
    state: &AppState,
    route: ProxyRoute,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if method == Method::OPTIONS
        && let Some(cors) = route.cors
    {
        let mut resp = StatusCode::NO_CONTENT.into_response();
        cors.apply(resp.headers_mut());
        return resp;
    }

    let has_body = method != Method::GET && method != Method::HEAD;
    let mut req = state
        .http
        .request(method.clone(), &route.url)
        .headers(outbound_headers(headers, &route));
    if has_body {
        req = req.body(body);
    }

    let upstream = match req.send().await {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(proxy = route.label, %method, url = %route.url, error = %e, "proxy request failed");
            let mut resp = (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response();
            if let Some(cors) = route.cors {
                cors.apply(resp.headers_mut());
            }
            return resp;
        }
    };
    tracing::debug!(proxy = route.label, %method, url = %route.url, status = %upstream.status(), "proxied");

    let status = upstream.status();
    let upstream_headers = upstream.headers().clone();
    let mut resp = Body::from_stream(upstream.bytes_stream()).into_response();
    *resp.status_mut() = status;
    let out = resp.headers_mut();
    for (name, value) in &upstream_headers {
        if name == header::CONTENT_LENGTH || is_hop_by_hop(name) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    if let Some(cors) = route.cors {
        cors.apply(out);
    }
    resp
}

fn upstream_not_configured() -> Response {
    GatewayError::upstream(
        "upstream_not_configured",
        "KAMUI_CODE_URL / --upstream-host is not set",
    )
    .into_response()
}

fn path_and_query(uri: &Uri) -> &str {
    uri.path_and_query().map_or("/", |pq| pq.as_str())
}

/// Strip a routing prefix, keeping the query; an empty remainder becomes `/`.
fn strip_routing_prefix(uri: &Uri, prefix: &str) -> String {
    let rest = path_and_query(uri).strip_prefix(prefix).unwrap_or_default();
    if rest.is_empty() {
        "/".to_string()
    } else if rest.starts_with('?') {
        format!("/{rest}")
    } else {
        rest.to_string()
    }
}

/// Generic MCP proxy. The `/mcp` prefix is kept upstream.
pub(crate) async fn forward_mcp(
    state: &AppState,
    method: Method,
    uri: &Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(base) = state.config.upstream_base() else {
        return upstream_not_configured();
    };
    let route = ProxyRoute {
        label: "mcp",
        url: format!("{base}{}", path_and_query(uri)),
        cors: Some(&MCP_CORS),
        default_auth: state.config.default_auth_header(),
        keep_client_origin: false,
    };
    forward(state, route, method, headers, body).await
}

/// `ANY /mcp/...`: event streams go through the SSE proxy, everything else is forwarded.
pub(crate) async fn mcp_passthrough(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if method == Method::GET && uri.path().ends_with("/sse") {
        return sse_proxy(&state, uri.path(), &uri).await;
    }
    forward_mcp(&state, method, &uri, headers, body).await
}

pub(crate) async fn root_sse(State(state): State<Arc<AppState>>, uri: Uri) -> Response {
    sse_proxy(&state, "/sse", &uri).await
}

/// `/kamui/<path>` to `<upstream>/<path>`.
pub(crate) async fn kamui(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(base) = state.config.upstream_base() else {
        return upstream_not_configured();
    };
    let route = ProxyRoute {
        label: "kamui",
        url: format!("{base}{}", strip_routing_prefix(&uri, "/kamui")),
        cors: Some(&REST_CORS),
        default_auth: state.config.default_auth_header(),
        keep_client_origin: false,
    };
    forward(&state, route, method, headers, body).await
}

/// `/backend/<path>` to `<backend target>/<path>`.
pub(crate) async fn backend(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let base = state.config.backend_target.trim_end_matches('/');
    let route = ProxyRoute {
        label: "backend",
        url: format!("{base}{}", strip_routing_prefix(&uri, "/backend")),
        cors: None,
        default_auth: None,
        keep_client_origin: true,
    };
    forward(&state, route, method, headers, body).await
}

fn has_mcp_prefix(path: &str) -> bool {
    MCP_PATH_PREFIXES.iter().any(|p| {
        path.strip_prefix(p)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    })
}

/// Router fallback: MCP-looking paths without the `/mcp` prefix are proxied, anything else is
/// served from the public directory.
pub(crate) async fn fallback(State(state): State<Arc<AppState>>, req: Request) -> Response {
    let path = req.uri().path().to_string();
    if !has_mcp_prefix(&path) {
        let mut resp = match ServeDir::new(&state.config.public_dir).oneshot(req).await {
            Ok(resp) => resp.into_response(),
            Err(never) => match never {},
        };
        resp.headers_mut().insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
        return resp;
    }

    let (parts, body) = req.into_parts();
    if parts.method == Method::GET && path.ends_with("/sse") {
        return sse_proxy(&state, &format!("/mcp{path}"), &parts.uri).await;
    }
    let Some(base) = state.config.upstream_base() else {
        return upstream_not_configured();
    };
    let body = match axum::body::to_bytes(body, state.config.json_limit).await {
        Ok(b) => b,
        Err(e) => {
            return GatewayError::bad_request("invalid_body", e.to_string()).into_response();
        }
    };
    let route = ProxyRoute {
        label: "mcp-fallback",
        url: format!("{base}/mcp{}", path_and_query(&parts.uri)),
        cors: Some(&FALLBACK_CORS),
        default_auth: None,
        keep_client_origin: false,
    };
    forward(&state, route, parts.method, parts.headers, body).await
}

/// Stream an upstream event stream to the caller.
///
/// `sid` and `auth` query parameters become `mcp-session-id` and `Authorization`. Dropping the
/// response body drops the upstream connection.
pub(crate) async fn sse_proxy(state: &AppState, upstream_path: &str, uri: &Uri) -> Response {
    let Some(base) = state.config.upstream_base() else {
        return upstream_not_configured();
    };
    let url = format!("{base}{upstream_path}");

    let mut headers = HeaderMap::new();
    headers.insert(header::ACCEPT, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    if let Some(sid) = query_param(uri, "sid").filter(|s| !s.is_empty())
        && let Ok(v) = HeaderValue::from_str(&sid)
    {
        headers.insert(crate::mcp::HEADER_SESSION_ID, v);
    }
    let auth = query_param(uri, "auth")
        .filter(|s| !s.is_empty())
        .and_then(|a| HeaderValue::from_str(&a).ok())
        .or_else(|| state.config.default_auth_header());
    if let Some(auth) = auth {
        headers.insert(header::AUTHORIZATION, auth);
    }

    let upstream = match state.http.get(&url).headers(headers).send().await {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(%url, error = %e, "SSE upstream request failed");
            return (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response();
        }
    };
    tracing::debug!(%url, status = %upstream.status(), "SSE stream opened");

    let mut resp = Body::from_stream(upstream.bytes_stream()).into_response();
    let out = resp.headers_mut();
    out.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    out.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    out.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    out.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static(SSE_EXPOSE_HEADERS),
    );
    resp
}
