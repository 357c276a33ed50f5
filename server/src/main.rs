#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # sshgate
//!
//! Interactive remote-shell proxy with per-command audit logging.
//!
//! sshgate accepts browser (or terminal-client) WebSocket connections,
//! opens a credentialed SSH shell on the requested host, and relays bytes
//! between the two. Every submitted command line is classified and written
//! to the audit store together with its captured output; every session is
//! tracked from open to close with accurate duration accounting.
//!
//! ## API surface
//!
//! | Method | Path                  | Description                              |
//! |--------|-----------------------|------------------------------------------|
//! | GET    | `/api/health`         | Liveness probe                           |
//! | GET    | `/api/ws`             | WebSocket for interactive shell sessions |
//! | GET    | `/api/sessions`       | Audit: list sessions (`?host=` filter)   |
//! | GET    | `/api/sessions/{id}`  | Audit: session detail with commands      |
//! | GET    | `/api/connections`    | Live connections (in-memory registry)    |
//!
//! ## Architecture
//!
//! ```text
//! main.rs       — entry point, clap, router setup, graceful shutdown
//! config.rs     — TOML + env-var configuration
//! state.rs      — AppState shared across handlers
//! classify.rs   — command categories, danger rules, boundary detection
//! ssh/          — russh remote shell client (PTY + shell channel)
//! session/      — per-connection lifecycle, relay, capture window, finalize
//! registry.rs   — live-connection index
//! audit/        — SQLite session/command store
//! ws/           — WebSocket upgrade and message dispatch
//! routes/       — REST read endpoints
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use axum::{routing::get, Router};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use sshgate::audit::AuditStore;
use sshgate::config::Config;
use sshgate::registry::ConnectionRegistry;
use sshgate::state::AppState;
use sshgate::{routes, ws};

/// Interactive remote-shell proxy with command auditing.
#[derive(Parser)]
#[command(name = "sshgate", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => None,
    };
    run_server(config_path.as_deref()).await;
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("sshgate v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    let store = match AuditStore::from_path(Path::new(&config.audit.db_path)).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("sshgate: failed to open audit store: {e}");
            std::process::exit(1);
        }
    };

    let state = AppState {
        config: Arc::new(config),
        start_time: Instant::now(),
        store,
        registry: ConnectionRegistry::new(),
    };

    let app = Router::new()
        .route("/api/health", get(routes::health::health))
        .route("/api/sessions", get(routes::sessions::list_sessions))
        .route("/api/sessions/{id}", get(routes::sessions::session_detail))
        .route("/api/connections", get(routes::connections::list_connections))
        .route("/api/ws", get(ws::ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
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
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    info!("Shutting down, {} live connection(s)", state.registry.len().await);
    info!("Goodbye");
}
