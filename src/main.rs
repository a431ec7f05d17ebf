use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod error;
mod relay;
mod upstream;

use config::Config;

const DEFAULT_CONFIG_PATH: &str = "/etc/chat-relay/config.toml";
const DEFAULT_LOG_FILTER: &str = "chat_relay=info,tower_http=warn";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("CHAT_RELAY_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

    // When invoked as a Docker HEALTHCHECK, hit /healthz and exit immediately.
    // This avoids needing any external tool (curl/wget) in the container image.
    if std::env::args().nth(1).as_deref() == Some("--healthcheck") {
        return healthcheck(&config_path).await;
    }

    let (config, load_error) = Config::load_or_default(&config_path);
    init_tracing(config.server.log_level.as_deref());
    if let Some(e) = load_error {
        warn!(
            path = %config_path.display(),
            error = %format!("{e:#}"),
            "config unusable, starting with defaults"
        );
    }

    let state = Arc::new(
        relay::AppState::new(Arc::new(config)).context("initialising upstream client")?,
    );
    let config = Arc::clone(&state.config);

    info!(
        port = config.server.port,
        upstream = %config.upstream.base_url,
        authenticated = state.upstream.is_authenticated(),
        "chat-relay starting"
    );

    let addr: SocketAddr = format!("0.0.0.0:{}", config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "API listening");

    let trace_layer = tower_http::trace::TraceLayer::new_for_http()
        .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
        .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO));

    let mut app = api::client::router(Arc::clone(&state))
        .layer(axum::middleware::from_fn(api::request_id::request_id_middleware))
        .layer(trace_layer);
    if config.server.cors {
        app = app.layer(tower_http::cors::CorsLayer::permissive());
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server error")?;

    info!("shutdown complete");
    Ok(())
}

/// `RUST_LOG` wins, then the config's `log_level`, then the built-in default.
fn init_tracing(config_level: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| match config_level {
            Some(level) => EnvFilter::try_new(level),
            None => EnvFilter::try_new(DEFAULT_LOG_FILTER),
        })
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

/// Lightweight healthcheck: GET /healthz and exit 0 on 200, 1 otherwise.
/// Invoked via `chat-relay --healthcheck` from Docker HEALTHCHECK.
async fn healthcheck(config_path: &Path) -> anyhow::Result<()> {
    let (config, _) = Config::load_or_default(config_path);
    let port = config.server.port;

    let url = format!("http://127.0.0.1:{port}/healthz");
    let resp = reqwest::get(&url).await?;

    if resp.status().is_success() {
        std::process::exit(0);
    } else {
        std::process::exit(1);
    }
}
