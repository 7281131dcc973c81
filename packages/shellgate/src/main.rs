use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Query, State, WebSocketUpgrade},
    response::{IntoResponse, Response},
    routing::get,
};
use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::prelude::*;

use shell_session::{CommandTracker, ProbeRunner, default_shell};

mod ansi;
mod capture;
mod clients;
mod config;
mod history;
mod profiles;
mod registry;
mod security;
mod ws;

use crate::clients::ClientRegistry;
use crate::config::GateConfig;
use crate::profiles::ProfileStore;
use crate::registry::SessionRegistry;

#[derive(Parser)]
#[command(name = "shellgate")]
#[command(about = "WebSocket gateway for local and remote shell sessions")]
struct Cli {
    /// Host to bind to
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Port for the gateway
    #[arg(short, long)]
    port: Option<u16>,

    /// Allow only remote SSH sessions; local operations are rejected
    #[arg(long)]
    ssh_only: bool,

    /// Custom data directory (defaults to ~/.shellgate)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Clone)]
struct AppState {
    clients: Arc<ClientRegistry>,
    registry: Arc<SessionRegistry>,
    profiles: Arc<ProfileStore>,
    probe: Arc<ProbeRunner>,
    config: Arc<GateConfig>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_directive = if cli.debug {
        "shellgate=debug,tower_http=debug,info"
    } else {
        "shellgate=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting shellgate");

    let data_dir = cli.data_dir.clone().unwrap_or_else(config::default_data_dir);
    let file_config: config::FileConfig = config::load_config(&data_dir)
        .extract()
        .context("Invalid configuration")?;

    // CLI flags override config.toml and environment
    let mut server_config = config::ServerConfig::from_file(&file_config.server);
    if let Some(host) = cli.host {
        server_config.host = host;
    }
    if let Some(port) = cli.port {
        server_config.port = port;
    }

    let mut gate_config = GateConfig::from_file(&file_config);
    if cli.ssh_only {
        gate_config.ssh_only = true;
    }
    let gate_config = Arc::new(gate_config);

    if gate_config.ssh_only {
        info!("SSH-only mode: local sessions and probes are disabled");
    }

    let tracker = Arc::new(CommandTracker::new());
    let clients = Arc::new(ClientRegistry::new());
    let registry = Arc::new(SessionRegistry::new(
        Arc::clone(&clients),
        Arc::clone(&tracker),
        Arc::clone(&gate_config),
    ));
    let profiles =
        Arc::new(ProfileStore::new(&data_dir).context("Failed to open the profile store")?);
    let probe = Arc::new(ProbeRunner::new(
        gate_config.shell.clone().unwrap_or_else(default_shell),
        tracker,
        gate_config.probe_timeout,
    ));

    let app_state = AppState {
        clients,
        registry: registry.clone(),
        profiles,
        probe,
        config: gate_config,
    };

    let app = Router::new()
        .route("/ws", get(gate_ws_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    let addr = server_config.bind_addr().parse::<SocketAddr>()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", server_config.bind_addr()))?;
    let actual_addr = listener.local_addr()?;
    info!("shellgate listening on ws://{}/ws", actual_addr);

    // Create shutdown signal handler
    let shutdown_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("Received shutdown signal, cleaning up...");
    };

    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    // Kill every live session and tracked subprocess before exiting
    registry.shutdown_all().await;

    info!("Shutdown complete");
    server_result
}

#[derive(Deserialize)]
struct WsParams {
    /// Durable client id from a previous connection, if any.
    client: Option<String>,
}

async fn gate_ws_handler(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| {
        ws::handle_gate_ws(
            socket,
            state.clients,
            state.registry,
            state.profiles,
            state.probe,
            state.config,
            params.client,
        )
    })
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "sessions": state.registry.count().await,
        "ssh_only": state.config.ssh_only,
    }))
}
