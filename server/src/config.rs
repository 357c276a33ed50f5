//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `SSHGATE_LISTEN`, `SSHGATE_AUDIT_DB`
//! 2. **Config file** — path via `--config <path>`, or `sshgate.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8022"
//!
//! [ssh]
//! connect_timeout_secs = 15
//! term = "xterm-256color"
//! rows = 24
//! cols = 80
//!
//! [session]
//! idle_timeout_secs = 0   # 0 = never finalize on inactivity
//!
//! [audit]
//! db_path = "/var/lib/sshgate/audit.db"
//! capture_window_ms = 2000
//! max_output_bytes = 65536
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8022`).
    #[serde(default = "default_listen")]
    pub listen: String,
}

/// Remote-shell client settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    /// TCP + handshake timeout for opening the remote shell (default 15 s).
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// TERM value requested for the remote PTY (default `xterm-256color`).
    #[serde(default = "default_term")]
    pub term: String,
    /// Requested PTY rows (default 24).
    #[serde(default = "default_rows")]
    pub rows: u16,
    /// Requested PTY columns (default 80).
    #[serde(default = "default_cols")]
    pub cols: u16,
}

/// Per-session lifecycle settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionConfig {
    /// Seconds of no input and no output before a session is finalized with
    /// status `timeout`. 0 disables the idle reaper (default).
    #[serde(default)]
    pub idle_timeout_secs: u64,
}

/// Audit store settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    /// SQLite database path. Override with `SSHGATE_AUDIT_DB`.
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Output-capture window after each command, in milliseconds (default
    /// 2000). Closed early when the next command arrives.
    #[serde(default = "default_capture_window_ms")]
    pub capture_window_ms: u64,
    /// Cap on captured output per command, in bytes (default 64 KiB).
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8022".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    15
}
fn default_term() -> String {
    "xterm-256color".to_string()
}
fn default_rows() -> u16 {
    24
}
fn default_cols() -> u16 {
    80
}
fn default_db_path() -> String {
    "/var/lib/sshgate/audit.db".to_string()
}
fn default_capture_window_ms() -> u64 {
    2000
}
fn default_max_output_bytes() -> usize {
    64 * 1024
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            term: default_term(),
            rows: default_rows(),
            cols: default_cols(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            capture_window_ms: default_capture_window_ms(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise
    /// looks for `sshgate.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("sshgate.toml").exists() {
            let content =
                std::fs::read_to_string("sshgate.toml").expect("Failed to read sshgate.toml");
            toml::from_str(&content).expect("Failed to parse sshgate.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(listen) = std::env::var("SSHGATE_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(db) = std::env::var("SSHGATE_AUDIT_DB") {
            config.audit.db_path = db;
        }

        config
    }
}
