use anyhow::Context as _;
use clap::Parser;
use std::io::IsTerminal as _;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

mod assets;
mod config;
mod error;
mod http;
mod mcp;
mod proxy;
mod saves;
mod upload;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    load_dotenv()?;

    let args = config::CliArgs::parse();
    let config = config::GatewayConfig::load(&args)?;

    if args.print_effective_config {
        let yaml = serde_yaml::to_string(&config).context("serialize effective config")?;
        print!("{yaml}");
        return Ok(());
    }

    init_logging(&args.log_level);
    tracing::info!("Starting devgw v{VERSION}");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?
        .block_on(run(config))
}

/// Seed the process environment from `.env` (or `DEVGW_ENV_FILE`) without overriding set keys.
fn load_dotenv() -> anyhow::Result<()> {
    let path = devgw_env::non_empty("DEVGW_ENV_FILE").map_or_else(|| PathBuf::from(".env"), PathBuf::from);
    let entries = devgw_env::pending_dotenv_entries(&path)
        .with_context(|| format!("read env file: {}", path.display()))?;
    for (key, value) in entries {
        // SAFETY: runs before the runtime and any other thread is started.
        unsafe { std::env::set_var(key, value) };
    }
    Ok(())
}

async fn run(config: config::GatewayConfig) -> anyhow::Result<()> {
    let bind = config.bind;
    match config.upstream_base() {
        Some(base) => tracing::info!(upstream = %base, "MCP upstream configured"),
        None => tracing::warn!("no upstream host configured; MCP routes will answer 502"),
    }
    tracing::info!(
        bridges = config.bridges.len(),
        backend = %config.backend_target,
        "gateway configured"
    );

    let state = Arc::new(http::AppState::new(config)?);
    let app = http::router(state);

    let ct = CancellationToken::new();
    let (listener, _bound) = bind_and_log(bind).await?;
    spawn_shutdown_watcher(ct.clone());

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .context("serve HTTP")?;

    tracing::info!("Gateway shut down gracefully");
    Ok(())
}

async fn bind_and_log(addr: SocketAddr) -> anyhow::Result<(tokio::net::TcpListener, SocketAddr)> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind address '{addr}'"))?;
    let bound = listener.local_addr().context("get bind address")?;
    tracing::info!("Starting HTTP server on {bound}");
    Ok((listener, bound))
}

fn spawn_shutdown_watcher(ct: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    tracing::warn!(error = %e, "failed to listen for Ctrl+C");
                }
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            () = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        ct.cancel();
    });
}

/// Initialize logging based on the log level string.
fn init_logging(log_level: &str) {
    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    // Human-readable on a terminal, JSON lines otherwise.
    if std::io::stdout().is_terminal() {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    }
}
