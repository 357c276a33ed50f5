//! REST endpoints over the audit history.
//!
//! Read-only surface consumed by the admin-reporting layer:
//!
//! - `GET /api/sessions`       — list sessions (optional `?host=` filter)
//! - `GET /api/sessions/{id}`  — session detail with its commands

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::audit::{CommandRecord, SessionRecord};
use crate::state::AppState;

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn session_json(s: &SessionRecord) -> Value {
    let mut obj = json!({
        "session_id": s.id,
        "user_id": s.user_id,
        "user_name": s.user_name,
        "host": s.host,
        "port": s.port,
        "login": s.login,
        "display_name": s.display_name,
        "status": s.status.as_str(),
        "created_at": ts(s.created_at),
    });
    if let Some(closed_at) = s.closed_at {
        obj["closed_at"] = json!(ts(closed_at));
    }
    if let Some(duration) = s.duration_secs {
        obj["duration_secs"] = json!(duration);
    }
    obj
}

fn command_json(c: &CommandRecord) -> Value {
    let mut obj = json!({
        "command_id": c.id,
        "session_id": c.session_id,
        "user_id": c.user_id,
        "host": c.host,
        "command": c.command,
        "output": c.output,
        "category": c.category.as_str(),
        "dangerous": c.dangerous,
        "executed_at": ts(c.executed_at),
    });
    if let Some(duration) = c.duration_ms {
        obj["duration_ms"] = json!(duration);
    }
    obj
}

/// Query parameters for the session listing.
#[derive(Deserialize)]
pub struct SessionListQuery {
    pub host: Option<String>,
}

/// `GET /api/sessions` — sessions newest first, optionally for one host.
pub async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<SessionListQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let sessions = state
        .store
        .sessions_by_host(query.host.as_deref())
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string(), "code": "STORE_ERROR"})),
            )
        })?;

    Ok(Json(json!({
        "sessions": sessions.iter().map(session_json).collect::<Vec<_>>(),
    })))
}

/// `GET /api/sessions/{id}` — one session plus its commands in order.
pub async fn session_detail(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let detail = state.store.session_detail(&id).await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string(), "code": "STORE_ERROR"})),
        )
    })?;

    match detail {
        Some((session, commands)) => Ok(Json(json!({
            "session": session_json(&session),
            "commands": commands.iter().map(command_json).collect::<Vec<_>>(),
        }))),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": format!("Session {id} not found"),
                "code": "SESSION_NOT_FOUND",
            })),
        )),
    }
}
