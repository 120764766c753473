use crate::config::GatewayConfig;
use crate::upload::PasteHosts;
use crate::{assets, mcp, proxy, saves, upload};
use anyhow::Context as _;
use axum::{
    Router,
    extract::{DefaultBodyLimit, Request},
    http::{HeaderName, HeaderValue},
    middleware::{self, Next},
    response::Response,
    routing::{any, get, post},
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;

const MEDIA_TIMEOUT: Duration = Duration::from_secs(120);

/// Shared, read-only request state.
#[derive(Clone)]
pub(crate) struct AppState {
    pub config: Arc<GatewayConfig>,
    /// Upstream MCP and proxy traffic. No timeout: event streams stay open.
    pub http: reqwest::Client,
    /// Media downloads and third-party uploads.
    pub media_http: reqwest::Client,
    pub paste_hosts: PasteHosts,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> anyhow::Result<Self> {
        Ok(Self {
            config: Arc::new(config),
            http: build_no_redirect_http_client("upstream HTTP client", None)?,
            media_http: build_no_redirect_http_client("media HTTP client", Some(MEDIA_TIMEOUT))?,
            paste_hosts: PasteHosts::default(),
        })
    }
}

fn build_no_redirect_http_client(
    label: &'static str,
    timeout: Option<Duration>,
) -> anyhow::Result<reqwest::Client> {
    // Upstreams should be configured with their final URL.
    let mut builder = reqwest::Client::builder().redirect(reqwest::redirect::Policy::none());
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder.build().with_context(|| format!("build {label}"))
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

async fn permissions_policy(req: Request, next: Next) -> Response {
    let mut resp = next.run(req).await;
    resp.headers_mut().insert(
        HeaderName::from_static("permissions-policy"),
        HeaderValue::from_static("xr-spatial-tracking=(self)"),
    );
    resp
}

async fn health() -> &'static str {
    "ok"
}

/// The whole HTTP surface.
///
/// Local API routes sit behind a permissive CORS layer; proxied routes stamp their own CORS
/// headers and answer `OPTIONS` themselves.
pub(crate) fn router(state: Arc<AppState>) -> Router {
    let config = state.config.clone();

    let local = Router::new()
        .route("/health", get(health))
        .route(
            "/mcp/config.json",
            get(assets::mcp_config).fallback(proxy::mcp_passthrough),
        )
        .route("/upload", post(upload::post_upload))
        .route("/expose", post(upload::post_expose))
        .route("/api/story-gen/list", get(saves::list))
        .route("/api/story-gen/load/{id}", get(saves::load))
        .route("/api/story-gen/save", post(saves::save))
        .route("/api/images", get(assets::list_images))
        .route("/backend", any(proxy::backend))
        .route("/backend/{*path}", any(proxy::backend))
        .nest_service("/saves", ServeDir::new(&config.saves_dir))
        .layer(cors_layer());

    let proxied = Router::new()
        .route("/mcp", any(proxy::mcp_passthrough))
        .route("/mcp/{*path}", any(proxy::mcp_passthrough))
        .route("/sse", get(proxy::root_sse))
        .route("/kamui", any(proxy::kamui))
        .route("/kamui/{*path}", any(proxy::kamui))
        .merge(mcp::bridge_routes(&config.bridges));

    local
        .merge(proxied)
        .fallback(proxy::fallback)
        .layer(middleware::from_fn(permissions_policy))
        .layer(DefaultBodyLimit::max(config.json_limit))
        .with_state(state)
}
