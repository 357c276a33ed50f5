//! Client-side connection controller.
//!
//! [`ConnectionController`] owns exactly one terminal instance and one
//! WebSocket at a time and drives the connect/reconnect/teardown state
//! machine. Re-entrant setup is refused while an attempt is live — a second
//! terminal or a second socket would double-process every keystroke and
//! every output chunk.
//!
//! State machine: `uninitialized → connecting → connected → shell-ready`,
//! with `reconnecting` reachable after any transport loss that was not
//! user-initiated, and `disconnected`/`error` as resting states the user can
//! leave by running the client again.
//!
//! Duplicate server events are harmless: the shell-open confirmation is
//! guarded per attempt, and historical servers emitted it under two names —
//! both are normalized into one internal event at the parse edge.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::terminal::TerminalWidget;

/// Ctrl-] — the local escape byte that disconnects, telnet-style.
pub const DISCONNECT_BYTE: u8 = 0x1d;

/// Controller lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerStatus {
    Uninitialized,
    Connecting,
    Connected,
    ShellReady,
    Reconnecting,
    Disconnected,
    Error,
}

/// Target and identity for the connect request.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub host: String,
    pub port: u16,
    pub login: String,
    pub credential: String,
    pub user_id: String,
    pub user_name: String,
    pub display_name: String,
}

impl ConnectRequest {
    fn to_message(&self, attempt_id: &str) -> Value {
        json!({
            "type": "shell.connect",
            "host": self.host,
            "port": self.port,
            "login": self.login,
            "credential": self.credential,
            "display_name": self.display_name,
            "attempt_id": attempt_id,
            "requesting_user": {
                "id": self.user_id,
                "name": self.user_name,
            },
        })
    }
}

/// Server events after normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Opened,
    Output(String),
    Closed(String),
    ErrorMsg { code: String, message: String },
}

/// Parse a server message into its normalized event.
///
/// `shell.ready` is a legacy spelling of `shell.opened` still emitted by
/// older servers; both collapse to [`ServerEvent::Opened`] here so the rest
/// of the controller dispatches on exactly one name.
pub fn parse_server_event(msg: &Value) -> Option<ServerEvent> {
    match msg["type"].as_str()? {
        "shell.opened" | "shell.ready" => Some(ServerEvent::Opened),
        "shell.output" => Some(ServerEvent::Output(
            msg["data"].as_str().unwrap_or("").to_string(),
        )),
        "shell.closed" => Some(ServerEvent::Closed(
            msg["reason"].as_str().unwrap_or("closed").to_string(),
        )),
        "error" => Some(ServerEvent::ErrorMsg {
            code: msg["code"].as_str().unwrap_or("UNKNOWN").to_string(),
            message: msg["message"].as_str().unwrap_or("unknown error").to_string(),
        }),
        _ => None,
    }
}

/// Per-attempt guard for the shell-open confirmation.
#[derive(Debug, Default)]
pub struct AttemptState {
    opened: bool,
}

impl AttemptState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the confirmation. Returns `true` exactly once per attempt —
    /// redeliveries and alias duplicates return `false` and must be ignored.
    pub fn confirm_opened(&mut self) -> bool {
        !std::mem::replace(&mut self.opened, true)
    }

    pub fn opened(&self) -> bool {
        self.opened
    }
}

/// How a live attempt ended.
#[derive(Debug)]
enum SessionEnd {
    /// User hit the escape key or stdin reached EOF.
    UserQuit,
    /// The server finalized the session.
    ServerClosed(String),
    /// The transport dropped without the user asking for it.
    TransportLost,
    /// Terminal failure for this attempt (open rejected, connect refused).
    Failed(String),
}

/// The per-process controller instance.
pub struct ConnectionController {
    config: ClientConfig,
    request: ConnectRequest,
    status: ControllerStatus,
    /// Live-attempt guard: true while a terminal + socket pair exists.
    live: bool,
}

impl ConnectionController {
    pub fn new(config: ClientConfig, request: ConnectRequest) -> Self {
        Self {
            config,
            request,
            status: ControllerStatus::Uninitialized,
            live: false,
        }
    }

    pub fn status(&self) -> ControllerStatus {
        self.status
    }

    /// Mark the controller live. Returns `false` if an attempt is already
    /// live — the caller must reuse the existing one instead of building a
    /// second terminal or socket.
    fn try_begin(&mut self) -> bool {
        if self.live {
            return false;
        }
        self.live = true;
        true
    }

    fn end_attempt(&mut self) {
        self.live = false;
    }

    /// Run until the user quits, the server closes the session, or the
    /// connection is lost twice. One reconnect attempt is made after a
    /// non-user-initiated transport loss, after a fixed delay.
    pub async fn run(&mut self) -> Result<(), String> {
        let mut reconnected = false;
        loop {
            if !self.try_begin() {
                return Err("connection controller is already live".to_string());
            }
            let end = self.drive_attempt().await;
            self.end_attempt();

            match end {
                SessionEnd::UserQuit => {
                    self.status = ControllerStatus::Disconnected;
                    eprintln!("sshgate-term: disconnected");
                    return Ok(());
                }
                SessionEnd::ServerClosed(reason) => {
                    self.status = ControllerStatus::Disconnected;
                    eprintln!("sshgate-term: session closed ({reason})");
                    return Ok(());
                }
                SessionEnd::Failed(message) => {
                    self.status = ControllerStatus::Error;
                    return Err(message);
                }
                SessionEnd::TransportLost => {
                    if reconnected {
                        self.status = ControllerStatus::Error;
                        return Err("connection lost again, giving up".to_string());
                    }
                    reconnected = true;
                    self.status = ControllerStatus::Reconnecting;
                    let delay = self.config.reconnect_delay_secs;
                    eprintln!("sshgate-term: connection lost, retrying in {delay}s");
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                }
            }
        }
    }

    /// One full attempt: socket, terminal, connect request, event loop.
    ///
    /// Teardown at the end is unconditional and complete — reader task
    /// cancelled, socket closed, terminal restored — before `run` may start
    /// a fresh attempt.
    async fn drive_attempt(&mut self) -> SessionEnd {
        self.status = ControllerStatus::Connecting;

        let ws = match tokio_tungstenite::connect_async(self.config.server_url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                return SessionEnd::Failed(format!(
                    "failed to reach {}: {e}",
                    self.config.server_url
                ));
            }
        };
        self.status = ControllerStatus::Connected;

        let (mut sink, mut stream) = ws.split();

        let mut terminal = match TerminalWidget::new() {
            Ok(t) => t,
            Err(e) => return SessionEnd::Failed(format!("terminal setup failed: {e}")),
        };

        // Keystroke reader. Cancelled (not just dropped) on teardown so no
        // stale reader survives into a later attempt.
        let cancel = CancellationToken::new();
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(64);
        let stdin_cancel = cancel.clone();
        let stdin_task = tokio::spawn(async move {
            let mut stdin = tokio::io::stdin();
            let mut buf = [0u8; 1024];
            loop {
                tokio::select! {
                    () = stdin_cancel.cancelled() => break,
                    read = stdin.read(&mut buf) => match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stdin_tx.send(buf[..n].to_vec()).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });

        // Connect request — exactly once per attempt.
        let attempt_id = Uuid::new_v4().to_string();
        let connect_msg = self.request.to_message(&attempt_id).to_string();
        if sink.send(Message::Text(connect_msg)).await.is_err() {
            cancel.cancel();
            stdin_task.abort();
            return SessionEnd::TransportLost;
        }

        let mut attempt = AttemptState::new();
        let warn_at =
            tokio::time::Instant::now() + Duration::from_secs(self.config.open_warning_secs);
        let mut warned = false;

        let end = loop {
            tokio::select! {
                // Slow-open notice: printed once, never aborts the attempt.
                () = tokio::time::sleep_until(warn_at), if !warned && !attempt.opened() => {
                    warned = true;
                    terminal.notice("opening the remote shell is taking longer than expected, still trying...");
                }
                chunk = stdin_rx.recv() => {
                    match chunk {
                        None => break SessionEnd::UserQuit,
                        Some(bytes) => {
                            if bytes.contains(&DISCONNECT_BYTE) {
                                // Best-effort notice; the server also
                                // finalizes on socket close.
                                let _ = sink
                                    .send(Message::Text(
                                        json!({"type": "shell.disconnect"}).to_string(),
                                    ))
                                    .await;
                                break SessionEnd::UserQuit;
                            }
                            let data = String::from_utf8_lossy(&bytes).into_owned();
                            let msg = json!({"type": "shell.input", "data": data}).to_string();
                            if sink.send(Message::Text(msg)).await.is_err() {
                                break SessionEnd::TransportLost;
                            }
                        }
                    }
                }
                incoming = stream.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            let Ok(parsed) = serde_json::from_str::<Value>(&text) else {
                                debug!("unparseable server message");
                                continue;
                            };
                            match parse_server_event(&parsed) {
                                Some(ServerEvent::Opened) => {
                                    if attempt.confirm_opened() {
                                        self.status = ControllerStatus::ShellReady;
                                    }
                                }
                                Some(ServerEvent::Output(data)) => {
                                    let _ = terminal.write_bytes(data.as_bytes());
                                }
                                Some(ServerEvent::Closed(reason)) => {
                                    break SessionEnd::ServerClosed(reason);
                                }
                                Some(ServerEvent::ErrorMsg { code, message }) => {
                                    terminal.notice(&format!("error [{code}]: {message}"));
                                    if !attempt.opened() {
                                        // Open failed — terminal for this
                                        // attempt; retry is the user's call.
                                        break SessionEnd::Failed(message);
                                    }
                                }
                                None => {}
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break SessionEnd::TransportLost,
                        Some(Err(e)) => {
                            debug!("transport error: {e}");
                            break SessionEnd::TransportLost;
                        }
                        _ => {}
                    }
                }
            }
        };

        // Full teardown, strictly before any new attempt may start.
        cancel.cancel();
        stdin_task.abort();
        let _ = sink.close().await;
        drop(terminal);

        end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> ConnectionController {
        ConnectionController::new(
            ClientConfig::default(),
            ConnectRequest {
                host: "10.0.0.5".to_string(),
                port: 22,
                login: "deploy".to_string(),
                credential: "secret".to_string(),
                user_id: "u-42".to_string(),
                user_name: "alice".to_string(),
                display_name: "web-01".to_string(),
            },
        )
    }

    #[test]
    fn starts_uninitialized() {
        assert_eq!(controller().status(), ControllerStatus::Uninitialized);
    }

    #[test]
    fn second_begin_is_refused_while_live() {
        let mut c = controller();
        assert!(c.try_begin());
        assert!(!c.try_begin());
        c.end_attempt();
        assert!(c.try_begin());
    }

    #[test]
    fn open_confirmation_is_idempotent() {
        let mut attempt = AttemptState::new();
        assert!(attempt.confirm_opened());
        assert!(!attempt.confirm_opened());
        assert!(attempt.opened());
    }

    #[test]
    fn legacy_alias_normalizes_to_opened() {
        let canonical = json!({"type": "shell.opened", "host": "h", "login": "l"});
        let legacy = json!({"type": "shell.ready"});
        assert_eq!(parse_server_event(&canonical), Some(ServerEvent::Opened));
        assert_eq!(parse_server_event(&legacy), Some(ServerEvent::Opened));
    }

    #[test]
    fn duplicate_confirmations_across_aliases_collapse() {
        let mut attempt = AttemptState::new();
        for msg in [
            json!({"type": "shell.opened"}),
            json!({"type": "shell.ready"}),
            json!({"type": "shell.opened"}),
        ] {
            if parse_server_event(&msg) == Some(ServerEvent::Opened) {
                attempt.confirm_opened();
            }
        }
        assert!(attempt.opened());
    }

    #[test]
    fn output_and_close_events_parse() {
        let output = json!({"type": "shell.output", "data": "hello"});
        assert_eq!(
            parse_server_event(&output),
            Some(ServerEvent::Output("hello".to_string()))
        );

        let closed = json!({"type": "shell.closed", "reason": "idle_timeout"});
        assert_eq!(
            parse_server_event(&closed),
            Some(ServerEvent::Closed("idle_timeout".to_string()))
        );

        let unknown = json!({"type": "shell.renamed"});
        assert_eq!(parse_server_event(&unknown), None);
    }

    #[test]
    fn connect_message_carries_identity() {
        let c = controller();
        let msg = c.request.to_message("attempt-1");
        assert_eq!(msg["type"], "shell.connect");
        assert_eq!(msg["host"], "10.0.0.5");
        assert_eq!(msg["requesting_user"]["id"], "u-42");
        assert_eq!(msg["attempt_id"], "attempt-1");
    }
}
