use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod bridge;
mod config;
mod error;
mod handlers;
mod metrics;
mod qr;
#[cfg(test)]
mod test_helpers;

use auto_react::{
    Connector, EventBroadcaster, FsCredentialStore, PairingFlow, ReactorRegistry, SessionManager,
    SessionStore,
};

use crate::bridge::BridgeConnector;
use crate::config::{AutoReactConfig, FileConfig, ServerConfig};
use crate::metrics::ServerMetrics;

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
#[command(name = "auto-react")]
#[command(about = "Pairs messaging accounts and auto-reacts to channel posts")]
struct Cli {
    /// Custom data directory (defaults to ~/.auto-react)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Listen host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Listen port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub sessions: Arc<SessionManager>,
    pub pairing: Arc<PairingFlow>,
    pub registry: Arc<ReactorRegistry>,
    /// Feed shared by every session, served on `/logs`
    pub events: Arc<EventBroadcaster>,
    /// Server metrics for observability
    pub metrics: Arc<ServerMetrics>,
    pub server_config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(
        server_config: ServerConfig,
        config: &AutoReactConfig,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let events = Arc::new(EventBroadcaster::new(
            server_config.history_capacity,
            server_config.observer_buffer,
        ));
        let sessions = Arc::new(SessionManager::new(
            Arc::new(FsCredentialStore::new(&config.sessions_dir)),
            connector,
            Arc::new(SessionStore::new()),
            events.clone(),
        ));
        let pairing = Arc::new(PairingFlow::new(
            sessions.clone(),
            server_config.pairing.clone(),
        ));
        let registry = Arc::new(ReactorRegistry::new(
            sessions.clone(),
            server_config.reactor.clone(),
        ));

        Self {
            sessions,
            pairing,
            registry,
            events,
            metrics: Arc::new(ServerMetrics::new()),
            server_config: Arc::new(server_config),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_directive = if cli.debug {
        "auto_react=debug,auto_react_server=debug,tower_http=debug,info"
    } else {
        "auto_react=info,auto_react_server=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting auto-react server");

    let config = AutoReactConfig::new(cli.data_dir)?;
    let mut file_config: FileConfig = config::load_config(&config.data_dir)
        .extract()
        .with_context(|| {
            format!(
                "Invalid configuration in {}",
                config.config_toml_path().display()
            )
        })?;
    if let Some(host) = cli.host {
        file_config.server.host = host;
    }
    if let Some(port) = cli.port {
        file_config.server.port = port;
    }
    let server_config = ServerConfig::from_file(&file_config)?;
    let bind_addr = server_config.bind_addr;

    info!("Gateway bridge: {}", server_config.gateway.bridge_url);
    let connector = Arc::new(BridgeConnector::new(&server_config.gateway));
    let app_state = AppState::new(server_config, &config, connector);

    // Clone references needed for shutdown cleanup
    let registry_for_shutdown = app_state.registry.clone();
    let sessions_for_shutdown = app_state.sessions.clone();

    let app = handlers::app_router(app_state)
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    let actual_addr = listener.local_addr()?;

    info!("auto-react listening on http://{}", actual_addr);
    info!("API endpoints:");
    info!("  POST   /qr        - Pair a new session");
    info!("  POST   /start     - Start auto-reacting");
    info!("  POST   /stop      - Stop auto-reacting");
    info!("  GET    /reactors  - List running reactors");
    info!("  GET    /logs      - WebSocket event feed");

    // Create shutdown signal handler
    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
    };

    // Run server with graceful shutdown
    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    info!("Stopping running reactors...");
    registry_for_shutdown.stop_all().await;
    sessions_for_shutdown.close_all().await;

    info!("Shutdown complete");
    server_result
}
