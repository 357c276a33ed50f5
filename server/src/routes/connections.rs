//! Live-connection introspection endpoint.

use axum::{extract::State, Json};
use chrono::SecondsFormat;
use serde_json::{json, Value};

use crate::state::AppState;

/// `GET /api/connections` — who is connected right now.
///
/// Backed by the in-memory registry: live connections only, rebuilt from
/// nothing on restart. Historical sessions live under `/api/sessions`.
pub async fn list_connections(State(state): State<AppState>) -> Json<Value> {
    let entries = state.registry.snapshot().await;
    let connections: Vec<Value> = entries
        .iter()
        .map(|(connection_id, entry)| {
            json!({
                "connection_id": connection_id,
                "session_id": entry.session_id,
                "user_id": entry.user_id,
                "host": entry.host,
                "connected_at": entry
                    .connected_at
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
            })
        })
        .collect();

    Json(json!({
        "connections": connections,
    }))
}
