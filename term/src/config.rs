//! Client configuration: CLI arguments plus an optional TOML file.
//!
//! Precedence (highest wins): CLI flags > `SSHGATE_*` env vars > config
//! file > compiled defaults. The credential is never read from the config
//! file — pass `--credential` or set `SSHGATE_CREDENTIAL`.

use clap::Parser;
use serde::Deserialize;
use std::path::Path;

/// Terminal client for sshgate — interactive remote shell over WebSocket.
#[derive(Parser, Debug)]
#[command(name = "sshgate-term", version)]
pub struct Cli {
    /// Path to TOML config file (default: sshgate-term.toml in CWD if present).
    #[arg(long)]
    pub config: Option<String>,

    /// sshgate server WebSocket URL (e.g. ws://127.0.0.1:8022/api/ws).
    #[arg(long)]
    pub server: Option<String>,

    /// Target host to open a shell on.
    #[arg(long)]
    pub host: String,

    /// Target SSH port.
    #[arg(long, default_value_t = 22)]
    pub port: u16,

    /// Remote login name.
    #[arg(long)]
    pub login: String,

    /// Remote credential. Falls back to the SSHGATE_CREDENTIAL env var.
    #[arg(long)]
    pub credential: Option<String>,

    /// Requesting user id (for the audit trail).
    #[arg(long)]
    pub user_id: String,

    /// Requesting user display name.
    #[arg(long, default_value = "")]
    pub user_name: String,

    /// Display name for the target host (defaults to the host).
    #[arg(long)]
    pub display_name: Option<String>,
}

/// Settings from the optional TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Server WebSocket URL.
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Delay before the single reconnect attempt after transport loss.
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    /// How long to wait for shell-open confirmation before printing a
    /// "taking longer than expected" notice (the attempt is not aborted).
    #[serde(default = "default_open_warning_secs")]
    pub open_warning_secs: u64,
}

fn default_server_url() -> String {
    "ws://127.0.0.1:8022/api/ws".to_string()
}
fn default_reconnect_delay_secs() -> u64 {
    3
}
fn default_open_warning_secs() -> u64 {
    10
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            open_warning_secs: default_open_warning_secs(),
        }
    }
}

impl ClientConfig {
    /// Load the file config and apply env/CLI overrides.
    pub fn load(cli: &Cli) -> Result<Self, String> {
        let mut config = if let Some(ref p) = cli.config {
            let content =
                std::fs::read_to_string(p).map_err(|e| format!("failed to read {p}: {e}"))?;
            toml::from_str(&content).map_err(|e| format!("failed to parse {p}: {e}"))?
        } else if Path::new("sshgate-term.toml").exists() {
            let content = std::fs::read_to_string("sshgate-term.toml")
                .map_err(|e| format!("failed to read sshgate-term.toml: {e}"))?;
            toml::from_str(&content)
                .map_err(|e| format!("failed to parse sshgate-term.toml: {e}"))?
        } else {
            ClientConfig::default()
        };

        if let Ok(url) = std::env::var("SSHGATE_SERVER") {
            config.server_url = url;
        }
        if let Some(ref url) = cli.server {
            config.server_url = url.clone();
        }

        Ok(config)
    }
}

/// Resolve the credential from the CLI flag or environment.
pub fn resolve_credential(cli: &Cli) -> Result<String, String> {
    if let Some(ref c) = cli.credential {
        return Ok(c.clone());
    }
    std::env::var("SSHGATE_CREDENTIAL")
        .map_err(|_| "no credential: pass --credential or set SSHGATE_CREDENTIAL".to_string())
}
