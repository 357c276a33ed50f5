//! # sshgate-term
//!
//! Terminal client for sshgate. Opens one WebSocket to the proxy, sends the
//! connect request, and relays bytes between the local terminal and the
//! remote shell. Ctrl-] disconnects.
//!
//! ```text
//! main.rs       — entry point, arg parsing, controller launch
//! config.rs     — CLI + TOML configuration
//! controller.rs — connection state machine (connect, reconnect, teardown)
//! terminal.rs   — raw-mode terminal with verbatim byte passthrough
//! ```

mod config;
mod controller;
mod terminal;

use clap::Parser;
use config::{resolve_credential, Cli, ClientConfig};
use controller::{ConnectionController, ConnectRequest};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    // Logs go to stderr so they never interleave with shell output framing.
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("sshgate-term: configuration error: {e}");
            std::process::exit(1);
        }
    };

    let credential = match resolve_credential(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("sshgate-term: {e}");
            std::process::exit(1);
        }
    };

    let request = ConnectRequest {
        display_name: cli.display_name.clone().unwrap_or_else(|| cli.host.clone()),
        host: cli.host,
        port: cli.port,
        login: cli.login,
        credential,
        user_id: cli.user_id,
        user_name: cli.user_name,
    };

    eprintln!(
        "sshgate-term: connecting to {}@{}:{} via {} (Ctrl-] to disconnect)",
        request.login, request.host, request.port, config.server_url
    );

    let mut controller = ConnectionController::new(config, request);
    if let Err(e) = controller.run().await {
        eprintln!("sshgate-term: {e}");
        std::process::exit(1);
    }
}
