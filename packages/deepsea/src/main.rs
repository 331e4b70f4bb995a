use anyhow::{Context, Result};
use axum::{Router, routing::get};
use clap::Parser;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio_util::sync::CancellationToken;
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod config;
mod db;
mod error;
mod handlers;
mod history;
mod metrics;
mod relay;
mod views;
mod ws;

use crate::config::{DeepSeaConfig, FileConfig, RelayConfig};
use crate::history::History;
use crate::metrics::ServerMetrics;
use crate::relay::Relay;

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "deepsea")]
#[command(about = "Real-time WebSocket broadcast relay with history replay")]
struct Cli {
    /// Custom data directory (defaults to ~/.deepsea)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Host to bind to (overrides [server] host)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Port for the relay (overrides [server] port, 0 = auto-select)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub relay: Arc<Relay>,
    /// Server metrics for observability
    pub metrics: Arc<ServerMetrics>,
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::relay_handler))
        .route("/ws", get(handlers::relay_handler))
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/health/ready", get(handlers::health_ready_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_directive = if cli.debug {
        "deepsea=debug,tower_http=debug,info"
    } else {
        "deepsea=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting Deep Sea relay");

    let config = DeepSeaConfig::new(cli.data_dir.clone())?;
    let file_config: FileConfig = crate::config::load_config(&config.data_dir)
        .extract()
        .with_context(|| format!("Invalid configuration in {:?}", config.config_toml_path()))?;
    let config = config.with_history_override(&file_config.history);
    let relay_config = RelayConfig::from_file(&file_config.relay);

    info!(
        "Relay config: heartbeat={:?} every {}s, history_limit={}, delimiter={:?}",
        relay_config.heartbeat_mode,
        relay_config.heartbeat_interval.as_secs(),
        relay_config.history_limit,
        relay_config.chat_delimiter
    );

    // An unopenable backend is fatal; an unreadable one only starts empty
    let store = history::open_store(&config, file_config.history.backend)
        .await
        .context("Failed to open history store")?;
    let history = Arc::new(History::bootstrap(store, relay_config.history_limit).await);

    let metrics = Arc::new(ServerMetrics::new());
    let relay = Arc::new(Relay::new(relay_config, history, metrics.clone()));

    let heartbeat_cancel = CancellationToken::new();
    let heartbeat_task = relay.spawn_heartbeat(heartbeat_cancel.clone());

    let app = build_router(AppState {
        relay: relay.clone(),
        metrics,
    });

    let host = cli.host.unwrap_or(file_config.server.host);
    let port = cli.port.unwrap_or(file_config.server.port);
    let addr = format!("{}:{}", host, port)
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid listen address {}:{}", host, port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("🚀 Deep Sea relay listening on ws://{}", actual_addr);
    info!("");
    info!("Landing page: http://{}/", actual_addr);
    info!("Endpoints:");
    info!("  GET /, /ws         - WebSocket relay (upgrade) or landing page");
    info!("  GET /health        - Health summary");
    info!("  GET /health/live   - Liveness probe");
    info!("  GET /health/ready  - Readiness probe (history backend)");
    info!("  GET /metrics       - Relay metrics");
    warn!("🔑 Current reset key: {}", relay.current_key().await);

    // Create shutdown signal handler
    let relay_for_shutdown = relay.clone();
    let cancel_for_shutdown = heartbeat_cancel.clone();
    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Received shutdown signal, cleaning up...");
        cancel_for_shutdown.cancel();
        relay_for_shutdown.shutdown().await;
    };

    // Run server with graceful shutdown
    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    if let Err(e) = heartbeat_task.await {
        warn!("Heartbeat task ended abnormally: {}", e);
    }

    info!("Shutdown complete");
    server_result
}
