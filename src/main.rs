#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # echoshell
//!
//! Voice-driven remote terminal plumbing. One binary, two roles:
//!
//! - `echoshell relay` — the publicly addressable relay: tunnel registration,
//!   HTTP↔WS proxying, terminal/recording/agent stream fan-out.
//! - `echoshell agent` — the workstation agent: PTY sessions, headless
//!   Cursor/Claude execution, the voice/text agent pipeline, and the outbound
//!   tunnel connection to the relay.

use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use echoshell::agent::AgentHandler;
use echoshell::config::Config;
use echoshell::history::{self, ChatHistoryStore};
use echoshell::relay::{heartbeat, RelayState};
use echoshell::sessions::SessionManager;
use echoshell::tunnel::{client, dispatch::Dispatcher, FrameSender};
use echoshell::util::rand_hex;

/// Voice-driven remote terminal relay and workstation agent.
#[derive(Parser)]
#[command(name = "echoshell", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the public relay server.
    Relay {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Run the workstation agent.
    Agent {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match cli.command {
        Commands::Relay { config } => run_relay(config.as_deref()).await,
        Commands::Agent { config } => run_agent(config.as_deref()).await,
    }
}

fn init_tracing(config: &Config) {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}

async fn run_relay(config_path: Option<&str>) {
    let config = Config::load(config_path);
    init_tracing(&config);

    let validation_errors = config.validate_relay();
    if !validation_errors.is_empty() {
        for err in &validation_errors {
            error!("Config error: {err}");
        }
        std::process::exit(1);
    }

    info!("echoshell relay v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Public URL: {}", config.public_url());

    let port = config.relay.port;
    let max_connections = config.relay.max_connections;
    let state = RelayState::new(Arc::new(config));

    let reaper = heartbeat::spawn_reaper(state.clone());

    let app = state
        .clone()
        .router()
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections));

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .expect("Failed to bind");
    info!("Relay listening on port {port}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    info!("Shutting down...");
    reaper.abort();
    state.shutdown().await;
    info!("Goodbye");
}

async fn run_agent(config_path: Option<&str>) {
    let config = Config::load(config_path);
    init_tracing(&config);

    let validation_errors = config.validate_station();
    if !validation_errors.is_empty() {
        for err in &validation_errors {
            error!("Config error: {err}");
        }
        std::process::exit(1);
    }

    info!("echoshell agent v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Relay: {}", config.station.relay_url.as_deref().unwrap_or(""));

    // Chat history survives restarts; sessions marked inactive before the
    // restart are dropped, and the terminal-session list is cleared (PTYs are
    // never reattached).
    let db_path = history::default_db_path(&config.station.data_dir);
    let history_store: Option<Arc<ChatHistoryStore>> = match ChatHistoryStore::open(&db_path) {
        Ok(store) => {
            if let Err(e) = store.cleanup_old_sessions().await {
                error!("Chat history cleanup failed: {e}");
            }
            if let Err(e) = store.clear_session_metadata().await {
                error!("Session metadata cleanup failed: {e}");
            }
            Some(store)
        }
        Err(e) => {
            error!("Chat history disabled: {e}");
            None
        }
    };

    let config = Arc::new(config);
    let frames = FrameSender::new();
    let sessions = SessionManager::new(
        &config.station,
        config.headless.clone(),
        frames.clone(),
        history_store.clone(),
    );
    let agent = AgentHandler::new(
        sessions.clone(),
        frames.clone(),
        history_store.clone(),
        &config.agent,
        &config.station.shell,
        &config.station.work_root,
    );
    let dispatcher = Arc::new(Dispatcher {
        sessions: sessions.clone(),
        history: history_store,
        client_auth_key: rand_hex(32),
        start_time: Instant::now(),
    });

    let ctx = client::StationContext {
        config,
        frames,
        sessions: sessions.clone(),
        dispatcher,
        agent,
        connected: Arc::new(AtomicBool::new(false)),
        reconnects: Arc::new(AtomicU64::new(0)),
    };
    let tunnel_task = tokio::spawn(client::run(ctx));

    shutdown_signal().await;

    info!("Shutting down...");
    tunnel_task.abort();
    sessions.destroy_all().await;
    info!("Goodbye");
}
