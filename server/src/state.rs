//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::audit::AuditStore;
use crate::config::Config;
use crate::registry::ConnectionRegistry;

/// Shared application state for the sshgate server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Audit history: session and command records.
    pub store: AuditStore,
    /// In-memory index of currently open sessions.
    pub registry: ConnectionRegistry,
}
