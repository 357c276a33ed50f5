//! WebSocket transport for interactive remote-shell sessions.
//!
//! ## Connection lifecycle
//!
//! 1. Client connects to `GET /api/ws`; each connection gets an id that keys
//!    the active-connection registry for its lifetime.
//! 2. All messages are JSON objects with a `"type"` field.
//! 3. A connection drives at most one session at a time: `shell.connect`
//!    opens it, `shell.input` feeds it, `shell.disconnect` (or the socket
//!    closing) finalizes it.
//!
//! ## Message types (client → server)
//!
//! | Type               | Fields                                                         |
//! |--------------------|----------------------------------------------------------------|
//! | `shell.connect`    | `host`, `port?`, `login`, `credential`, `requesting_user{id,…}`, `display_name?`, `attempt_id?` |
//! | `shell.input`      | `data` — raw keystrokes, forwarded verbatim                    |
//! | `shell.disconnect` | —                                                              |
//!
//! ## Message types (server → client)
//!
//! | Type           | Key fields                       |
//! |----------------|----------------------------------|
//! | `shell.opened` | `host`, `login`, `display_name`  |
//! | `shell.output` | `data` — verbatim, in order      |
//! | `shell.closed` | `reason`                         |
//! | `error`        | `code`, `message`                |

use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::session::{ConnectParams, ShellSession};
use crate::state::AppState;

/// `GET /api/ws` — WebSocket upgrade handler.
pub async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

/// Main WebSocket event loop.
///
/// Splits the socket into a sink (outgoing) and stream (incoming). Outgoing
/// messages are funneled through an mpsc channel so the session's relay
/// tasks can send without holding a reference to the socket.
async fn handle_ws(socket: axum::extract::ws::WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4().to_string();
    let (mut ws_sink, mut ws_stream) = socket.split();

    // Channel for sending messages back to the WebSocket
    let (tx, mut rx) = mpsc::channel::<Value>(256);

    info!("WS connection {connection_id} established");

    // Task: forward channel messages to the WebSocket sink
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(t) => t,
                Err(e) => {
                    error!("WS send: failed to serialize message: {e}");
                    continue;
                }
            };
            if ws_sink
                .send(axum::extract::ws::Message::Text(text.into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    // The one session this connection may drive.
    let mut session: Option<ShellSession> = None;

    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            axum::extract::ws::Message::Text(text) => {
                let Ok(parsed) = serde_json::from_str::<Value>(&text) else {
                    let _ = tx
                        .send(json!({
                            "type": "error",
                            "code": "INVALID_JSON",
                            "message": "Failed to parse JSON message"
                        }))
                        .await;
                    continue;
                };

                let msg_type = parsed["type"].as_str().unwrap_or("");
                match msg_type {
                    "shell.connect" => {
                        handle_connect(&state, &connection_id, &parsed, &tx, &mut session).await;
                    }
                    "shell.input" => {
                        let data = parsed["data"].as_str().unwrap_or("");
                        match session.as_mut() {
                            Some(live) if !live.is_finalized() => {
                                live.handle_input(data).await;
                            }
                            _ => {
                                debug!("WS {connection_id}: input with no open session");
                            }
                        }
                    }
                    "shell.disconnect" => {
                        if let Some(live) = session.take() {
                            live.disconnect().await;
                        }
                    }
                    _ => {
                        let _ = tx
                            .send(json!({
                                "type": "error",
                                "code": "UNKNOWN_TYPE",
                                "message": format!("Unknown message type: {msg_type}")
                            }))
                            .await;
                    }
                }
            }
            axum::extract::ws::Message::Close(_) => break,
            _ => {}
        }
    }

    // Transport closed — finalize whatever is still open. Finalize is
    // single-use, so racing the shell-side close triggers is fine.
    if let Some(live) = session.take() {
        live.transport_closed().await;
    }

    info!("WS connection {connection_id} closed");
    send_task.abort();
}

/// Handle `shell.connect` — validate, open the remote shell, start the session.
///
/// Every failure is reported exactly once as a terminal error for this
/// attempt; the server never retries on its own.
async fn handle_connect(
    state: &AppState,
    connection_id: &str,
    msg: &Value,
    tx: &mpsc::Sender<Value>,
    session: &mut Option<ShellSession>,
) {
    if session.as_ref().is_some_and(|s| !s.is_finalized()) {
        let _ = tx
            .send(json!({
                "type": "error",
                "code": "VALIDATION",
                "message": "A session is already open on this connection",
            }))
            .await;
        return;
    }
    // A finalized session can be replaced by a fresh attempt.
    *session = None;

    let params = match ConnectParams::from_message(msg) {
        Ok(p) => p,
        Err(e) => {
            let _ = tx
                .send(json!({
                    "type": "error",
                    "code": e.code(),
                    "message": e.to_string(),
                }))
                .await;
            return;
        }
    };

    match ShellSession::open(state, connection_id, params, tx.clone()).await {
        Ok(live) => {
            *session = Some(live);
        }
        Err(e) => {
            let _ = tx
                .send(json!({
                    "type": "error",
                    "code": e.code(),
                    "message": e.to_string(),
                }))
                .await;
        }
    }
}
