//! Session lifecycle management.
//!
//! One [`ShellSession`] per WebSocket connection, driving the session from
//! shell-open to finalize: it opens the remote shell, relays bytes in both
//! directions, detects command boundaries in the keystroke stream, feeds the
//! audit task, and finalizes the session record exactly once no matter which
//! close trigger fires first.
//!
//! ## Concurrency
//!
//! Each session owns three background tasks:
//!
//! - **output task** — drains the shell's event stream, forwards chunks to
//!   the transport as they arrive (no re-framing), and mirrors them into the
//!   audit channel with `try_send`.
//! - **audit task** — inserts command rows and runs the output-capture
//!   window. Store errors are logged and swallowed; a failed audit write
//!   never disturbs the interactive session.
//! - **idle reaper** (only when configured) — finalizes the session with
//!   status `timeout` after a period with no input and no output.
//!
//! Input forwarding runs on the WebSocket task itself. The two relay
//! directions never block each other; the only shared mutable state across
//! connections is the [`ConnectionRegistry`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AuditStore, CommandRecord, SessionRecord, SessionStatus};
use crate::classify::{categorize, is_dangerous, CommandAccumulator};
use crate::error::SessionError;
use crate::registry::{ConnectionEntry, ConnectionRegistry};
use crate::ssh::{RemoteShell, ShellEvent, ShellParams};
use crate::state::AppState;

/// Resolved identity of the user requesting the session.
#[derive(Debug, Clone)]
pub struct RequestingUser {
    pub id: String,
    pub name: String,
}

/// Validated parameters of a `shell.connect` request.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub login: String,
    pub credential: String,
    pub user: RequestingUser,
    pub display_name: String,
}

impl ConnectParams {
    /// Parse and validate a `shell.connect` message.
    ///
    /// Missing host, login, or credential, or a requesting user without a
    /// resolvable id, is a validation error: no session is created and the
    /// caller reports the error once.
    pub fn from_message(msg: &Value) -> Result<Self, SessionError> {
        let host = msg["host"].as_str().unwrap_or("").trim().to_string();
        if host.is_empty() {
            return Err(SessionError::Validation("host is required".into()));
        }
        let login = msg["login"].as_str().unwrap_or("").trim().to_string();
        if login.is_empty() {
            return Err(SessionError::Validation("login is required".into()));
        }
        let credential = msg["credential"].as_str().unwrap_or("").to_string();
        if credential.is_empty() {
            return Err(SessionError::Validation("credential is required".into()));
        }
        let port = match msg.get("port") {
            None | Some(Value::Null) => 22,
            Some(v) => match v.as_u64() {
                Some(p) if (1..=65535).contains(&p) => p as u16,
                _ => {
                    return Err(SessionError::Validation("port must be 1-65535".into()));
                }
            },
        };

        let user = &msg["requesting_user"];
        let user_id = user["id"].as_str().unwrap_or("").trim().to_string();
        if user_id.is_empty() {
            return Err(SessionError::Validation(
                "requesting user could not be resolved".into(),
            ));
        }
        let user_name = user["name"].as_str().unwrap_or("").to_string();

        let display_name = match msg["display_name"].as_str() {
            Some(n) if !n.trim().is_empty() => n.trim().to_string(),
            _ => host.clone(),
        };

        Ok(Self {
            host,
            port,
            login,
            credential,
            user: RequestingUser {
                id: user_id,
                name: user_name,
            },
            display_name,
        })
    }
}

/// Audit events flowing from the relay paths into the audit task.
#[derive(Debug)]
pub enum AuditEvent {
    /// A completed command line was detected in the keystroke stream.
    Command(CommandRecord),
    /// An output chunk to attribute to the open capture window, if any.
    Output(Vec<u8>),
}

/// Close reasons, mapped to the final session status.
#[derive(Debug, Clone, Copy)]
enum CloseTrigger {
    ShellClosed,
    ShellError,
    TransportClosed,
    DisconnectRequest,
    IdleTimeout,
}

impl CloseTrigger {
    fn status(self) -> SessionStatus {
        match self {
            Self::IdleTimeout => SessionStatus::Timeout,
            _ => SessionStatus::Disconnected,
        }
    }

    fn reason(self) -> &'static str {
        match self {
            Self::ShellClosed => "shell_closed",
            Self::ShellError => "shell_error",
            Self::TransportClosed => "transport_closed",
            Self::DisconnectRequest => "disconnect",
            Self::IdleTimeout => "idle_timeout",
        }
    }
}

/// State shared between the relay paths, the background tasks, and finalize.
struct SessionShared {
    session_id: String,
    connection_id: String,
    user_id: String,
    host: String,
    created_at: DateTime<Utc>,
    shell: RemoteShell,
    store: AuditStore,
    registry: ConnectionRegistry,
    out_tx: mpsc::Sender<Value>,
    cancel: CancellationToken,
    /// Single-use finalize guard: whichever trigger swaps this first runs
    /// the finalize logic; every later trigger is a no-op.
    finalized: AtomicBool,
    last_activity: Mutex<tokio::time::Instant>,
}

impl SessionShared {
    async fn touch(&self) {
        *self.last_activity.lock().await = tokio::time::Instant::now();
    }

    /// Finalize the session. Runs at most once per session even when close
    /// triggers fire concurrently.
    async fn finalize(&self, trigger: CloseTrigger) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }

        let closed_at = Utc::now();
        let duration_secs = (closed_at - self.created_at).num_seconds().max(0);
        let status = trigger.status();

        if let Err(e) = self
            .store
            .finalize_session(&self.session_id, closed_at, duration_secs, status)
            .await
        {
            warn!(
                "Session {}: finalize write failed (audit continues without it): {e}",
                self.session_id
            );
        }

        self.registry
            .remove(&self.connection_id, &self.session_id)
            .await;

        // Best-effort close notice; the transport may already be gone.
        let _ = self
            .out_tx
            .send(json!({
                "type": "shell.closed",
                "reason": trigger.reason(),
            }))
            .await;

        self.shell.shutdown().await;
        self.cancel.cancel();

        info!(
            "Session {} closed ({}, {}s, status {})",
            self.session_id,
            trigger.reason(),
            duration_secs,
            status.as_str()
        );
    }
}

/// A live session, owned by its WebSocket connection's event loop.
pub struct ShellSession {
    shared: Arc<SessionShared>,
    accumulator: CommandAccumulator,
    audit_tx: mpsc::Sender<AuditEvent>,
}

impl ShellSession {
    /// Open the remote shell and start the session.
    ///
    /// On success the session record exists (status `active`), the registry
    /// entry is in place, and `shell.opened` has been emitted exactly once.
    /// On failure nothing was created and the error is the caller's to
    /// report — once.
    pub async fn open(
        state: &AppState,
        connection_id: &str,
        params: ConnectParams,
        out_tx: mpsc::Sender<Value>,
    ) -> Result<Self, SessionError> {
        let shell_params = ShellParams {
            host: params.host.clone(),
            port: params.port,
            login: params.login.clone(),
            credential: params.credential.clone(),
            term: state.config.ssh.term.clone(),
            rows: state.config.ssh.rows,
            cols: state.config.ssh.cols,
            connect_timeout: Duration::from_secs(state.config.ssh.connect_timeout_secs),
        };

        let (shell, shell_events) = RemoteShell::open(shell_params).await?;

        let session_id = Uuid::new_v4().to_string();
        let created_at = Utc::now();

        let record = SessionRecord {
            id: session_id.clone(),
            user_id: params.user.id.clone(),
            user_name: params.user.name.clone(),
            host: params.host.clone(),
            port: params.port,
            login: params.login.clone(),
            display_name: params.display_name.clone(),
            status: SessionStatus::Active,
            created_at,
            closed_at: None,
            duration_secs: None,
        };
        if let Err(e) = state.store.insert_session(&record).await {
            warn!("Session {session_id}: audit insert failed: {e}");
        }

        state
            .registry
            .insert(
                connection_id,
                ConnectionEntry {
                    session_id: session_id.clone(),
                    user_id: params.user.id.clone(),
                    host: params.host.clone(),
                    connected_at: created_at,
                },
            )
            .await;

        let shared = Arc::new(SessionShared {
            session_id: session_id.clone(),
            connection_id: connection_id.to_string(),
            user_id: params.user.id.clone(),
            host: params.host.clone(),
            created_at,
            shell,
            store: state.store.clone(),
            registry: state.registry.clone(),
            out_tx: out_tx.clone(),
            cancel: CancellationToken::new(),
            finalized: AtomicBool::new(false),
            last_activity: Mutex::new(tokio::time::Instant::now()),
        });

        // Opened notification — exactly once per successful attempt.
        let _ = out_tx
            .send(json!({
                "type": "shell.opened",
                "host": params.host,
                "login": params.login,
                "display_name": params.display_name,
            }))
            .await;

        let (audit_tx, audit_rx) = mpsc::channel::<AuditEvent>(256);
        tokio::spawn(run_audit_task(
            state.store.clone(),
            audit_rx,
            Duration::from_millis(state.config.audit.capture_window_ms),
            state.config.audit.max_output_bytes,
        ));

        tokio::spawn(run_output_task(
            Arc::clone(&shared),
            shell_events,
            audit_tx.clone(),
        ));

        if state.config.session.idle_timeout_secs > 0 {
            tokio::spawn(run_idle_reaper(
                Arc::clone(&shared),
                Duration::from_secs(state.config.session.idle_timeout_secs),
            ));
        }

        info!(
            "Session {session_id} opened: {}@{}:{} for user {}",
            params.login, params.host, params.port, params.user.id
        );

        Ok(Self {
            shared,
            accumulator: CommandAccumulator::new(),
            audit_tx,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    /// Relay a keystroke chunk to the remote shell.
    ///
    /// The chunk is appended to the command accumulator first, then written
    /// to the shell unmodified — boundary detection never gates forwarding.
    /// Completed commands are handed to the audit task fire-and-forget.
    pub async fn handle_input(&mut self, data: &str) {
        if self.shared.finalized.load(Ordering::SeqCst) {
            return;
        }

        for text in self.accumulator.push(data) {
            let record = CommandRecord {
                id: Uuid::new_v4().to_string(),
                session_id: self.shared.session_id.clone(),
                user_id: self.shared.user_id.clone(),
                host: self.shared.host.clone(),
                category: categorize(&text),
                dangerous: is_dangerous(&text),
                command: text,
                output: String::new(),
                executed_at: Utc::now(),
                duration_ms: None,
            };
            if self.audit_tx.try_send(AuditEvent::Command(record)).is_err() {
                warn!(
                    "Session {}: audit channel full, command record dropped",
                    self.shared.session_id
                );
            }
        }

        self.shared.touch().await;

        if let Err(e) = self.shared.shell.writer.write(data.as_bytes()).await {
            debug!("Session {}: {e}", self.shared.session_id);
            self.shared.finalize(CloseTrigger::ShellError).await;
        }
    }

    /// Explicit disconnect request from the client.
    pub async fn disconnect(&self) {
        self.shared.finalize(CloseTrigger::DisconnectRequest).await;
    }

    /// The owning transport connection closed.
    pub async fn transport_closed(&self) {
        self.shared.finalize(CloseTrigger::TransportClosed).await;
    }

    pub fn is_finalized(&self) -> bool {
        self.shared.finalized.load(Ordering::SeqCst)
    }
}

/// Output direction: shell → transport, with an audit mirror.
///
/// Chunks are forwarded exactly as received, in order. A dead transport or a
/// closed/faulted shell stream finalizes the session (once).
async fn run_output_task(
    shared: Arc<SessionShared>,
    mut events: mpsc::Receiver<ShellEvent>,
    audit_tx: mpsc::Sender<AuditEvent>,
) {
    loop {
        let event = tokio::select! {
            () = shared.cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Some(ShellEvent::Output(chunk)) => {
                shared.touch().await;
                let data = String::from_utf8_lossy(&chunk).into_owned();
                if shared
                    .out_tx
                    .send(json!({"type": "shell.output", "data": data}))
                    .await
                    .is_err()
                {
                    shared.finalize(CloseTrigger::TransportClosed).await;
                    break;
                }
                // Mirror into the capture window; never block the relay.
                let _ = audit_tx.try_send(AuditEvent::Output(chunk));
            }
            Some(ShellEvent::Error(e)) => {
                warn!("Session {}: shell stream error: {e}", shared.session_id);
                let _ = shared
                    .out_tx
                    .send(json!({
                        "type": "error",
                        "code": "SHELL_ERROR",
                        "message": e,
                    }))
                    .await;
                shared.finalize(CloseTrigger::ShellError).await;
                break;
            }
            Some(ShellEvent::Closed) | None => {
                shared.finalize(CloseTrigger::ShellClosed).await;
                break;
            }
        }
    }
}

/// Idle reaper: finalizes the session with status `timeout` after a period
/// with no input and no output.
async fn run_idle_reaper(shared: Arc<SessionShared>, timeout: Duration) {
    loop {
        let deadline = *shared.last_activity.lock().await + timeout;
        if tokio::time::Instant::now() >= deadline {
            info!("Session {}: idle timeout", shared.session_id);
            shared.finalize(CloseTrigger::IdleTimeout).await;
            return;
        }
        tokio::select! {
            () = shared.cancel.cancelled() => return,
            () = tokio::time::sleep_until(deadline) => {}
        }
    }
}

/// State of one output-capture window.
struct CaptureWindow {
    command_id: String,
    opened: tokio::time::Instant,
    deadline: tokio::time::Instant,
    output: Vec<u8>,
    truncated: bool,
}

/// Audit task: persists command records and runs the capture window.
///
/// At most one window is open per session. A new command closes the previous
/// window early — overlapping fast commands therefore truncate the earlier
/// command's captured output at the later command's arrival; attribution is
/// a best-effort heuristic, not causal. All store errors are logged and
/// swallowed.
pub(crate) async fn run_audit_task(
    store: AuditStore,
    mut events: mpsc::Receiver<AuditEvent>,
    capture_window: Duration,
    max_output_bytes: usize,
) {
    let mut window: Option<CaptureWindow> = None;

    loop {
        let deadline = window.as_ref().map(|w| w.deadline);
        let event = match deadline {
            Some(deadline) => tokio::select! {
                event = events.recv() => event,
                () = tokio::time::sleep_until(deadline) => {
                    if let Some(w) = window.take() {
                        close_window(&store, w).await;
                    }
                    continue;
                }
            },
            None => events.recv().await,
        };

        match event {
            Some(AuditEvent::Command(record)) => {
                // Starting a new command ends the previous capture early.
                if let Some(w) = window.take() {
                    close_window(&store, w).await;
                }
                let command_id = record.id.clone();
                match store.insert_command(&record).await {
                    Ok(()) => {
                        let now = tokio::time::Instant::now();
                        window = Some(CaptureWindow {
                            command_id,
                            opened: now,
                            deadline: now + capture_window,
                            output: Vec::new(),
                            truncated: false,
                        });
                    }
                    Err(e) => {
                        warn!("Audit write failed for command {command_id}: {e}");
                    }
                }
            }
            Some(AuditEvent::Output(chunk)) => {
                if let Some(w) = window.as_mut() {
                    let room = max_output_bytes.saturating_sub(w.output.len());
                    if room >= chunk.len() {
                        w.output.extend_from_slice(&chunk);
                    } else {
                        w.output.extend_from_slice(&chunk[..room]);
                        w.truncated = true;
                    }
                }
            }
            None => {
                if let Some(w) = window.take() {
                    close_window(&store, w).await;
                }
                break;
            }
        }
    }
}

async fn close_window(store: &AuditStore, window: CaptureWindow) {
    let mut output = String::from_utf8_lossy(&window.output).into_owned();
    if window.truncated {
        output.push_str("\n[output truncated]");
    }
    let duration_ms = window.opened.elapsed().as_millis() as i64;
    if let Err(e) = store
        .attach_output(&window.command_id, &output, duration_ms)
        .await
    {
        warn!("Audit write failed for command {}: {e}", window.command_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect_msg() -> Value {
        json!({
            "type": "shell.connect",
            "host": "10.0.0.5",
            "port": 2222,
            "login": "deploy",
            "credential": "hunter2",
            "display_name": "web-01",
            "requesting_user": {"id": "u-42", "name": "alice", "role": "student"},
        })
    }

    #[test]
    fn connect_params_parse_full_message() {
        let params = ConnectParams::from_message(&connect_msg()).unwrap();
        assert_eq!(params.host, "10.0.0.5");
        assert_eq!(params.port, 2222);
        assert_eq!(params.login, "deploy");
        assert_eq!(params.user.id, "u-42");
        assert_eq!(params.display_name, "web-01");
    }

    #[test]
    fn connect_params_default_port_and_display_name() {
        let mut msg = connect_msg();
        msg.as_object_mut().unwrap().remove("port");
        msg.as_object_mut().unwrap().remove("display_name");
        let params = ConnectParams::from_message(&msg).unwrap();
        assert_eq!(params.port, 22);
        assert_eq!(params.display_name, "10.0.0.5");
    }

    #[test]
    fn connect_params_reject_missing_fields() {
        for field in ["host", "login", "credential"] {
            let mut msg = connect_msg();
            msg.as_object_mut().unwrap().remove(field);
            let err = ConnectParams::from_message(&msg).unwrap_err();
            assert_eq!(err.code(), "VALIDATION", "missing {field}");
        }
    }

    #[test]
    fn connect_params_reject_unresolvable_user() {
        let mut msg = connect_msg();
        msg["requesting_user"] = json!({"name": "nobody"});
        let err = ConnectParams::from_message(&msg).unwrap_err();
        assert_eq!(err.code(), "VALIDATION");

        msg["requesting_user"] = json!({"id": "  "});
        assert!(ConnectParams::from_message(&msg).is_err());
    }

    #[test]
    fn connect_params_reject_bad_port() {
        let mut msg = connect_msg();
        msg["port"] = json!(0);
        assert!(ConnectParams::from_message(&msg).is_err());
        msg["port"] = json!(70000);
        assert!(ConnectParams::from_message(&msg).is_err());
    }

    fn command(id: &str, text: &str) -> CommandRecord {
        CommandRecord {
            id: id.to_string(),
            session_id: "s1".to_string(),
            user_id: "u1".to_string(),
            host: "10.0.0.1".to_string(),
            command: text.to_string(),
            output: String::new(),
            category: categorize(text),
            dangerous: is_dangerous(text),
            executed_at: Utc::now(),
            duration_ms: None,
        }
    }

    async fn seed_session(store: &AuditStore) {
        store
            .insert_session(&SessionRecord {
                id: "s1".to_string(),
                user_id: "u1".to_string(),
                user_name: "alice".to_string(),
                host: "10.0.0.1".to_string(),
                port: 22,
                login: "root".to_string(),
                display_name: "box".to_string(),
                status: SessionStatus::Active,
                created_at: Utc::now(),
                closed_at: None,
                duration_secs: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn capture_window_attaches_output_after_deadline() {
        let store = AuditStore::in_memory().await.unwrap();
        seed_session(&store).await;

        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(run_audit_task(
            store.clone(),
            rx,
            Duration::from_millis(2000),
            64 * 1024,
        ));

        tx.send(AuditEvent::Command(command("c1", "pwd"))).await.unwrap();
        tx.send(AuditEvent::Output(b"/root\n".to_vec())).await.unwrap();

        // Past the capture deadline the output becomes immutable.
        tokio::time::sleep(Duration::from_millis(2100)).await;
        tx.send(AuditEvent::Output(b"late\n".to_vec())).await.unwrap();
        drop(tx);
        task.await.unwrap();

        let (_, commands) = store.session_detail("s1").await.unwrap().unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].output, "/root\n");
        assert!(commands[0].duration_ms.is_some());
    }

    #[tokio::test]
    async fn next_command_closes_previous_window_early() {
        let store = AuditStore::in_memory().await.unwrap();
        seed_session(&store).await;

        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(run_audit_task(
            store.clone(),
            rx,
            Duration::from_millis(2000),
            64 * 1024,
        ));

        tx.send(AuditEvent::Command(command("c1", "ls"))).await.unwrap();
        tx.send(AuditEvent::Output(b"a.txt\n".to_vec())).await.unwrap();
        // Second command arrives well inside the first window.
        tx.send(AuditEvent::Command(command("c2", "pwd"))).await.unwrap();
        tx.send(AuditEvent::Output(b"/root\n".to_vec())).await.unwrap();
        drop(tx);
        task.await.unwrap();

        let (_, commands) = store.session_detail("s1").await.unwrap().unwrap();
        assert_eq!(commands.len(), 2);
        let first = commands.iter().find(|c| c.id == "c1").unwrap();
        let second = commands.iter().find(|c| c.id == "c2").unwrap();
        // First command's capture was cut at the second command's arrival.
        assert_eq!(first.output, "a.txt\n");
        assert_eq!(second.output, "/root\n");
    }

    #[tokio::test]
    async fn capture_output_is_bounded() {
        let store = AuditStore::in_memory().await.unwrap();
        seed_session(&store).await;

        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(run_audit_task(
            store.clone(),
            rx,
            Duration::from_millis(2000),
            8,
        ));

        tx.send(AuditEvent::Command(command("c1", "cat big"))).await.unwrap();
        tx.send(AuditEvent::Output(b"0123456789abcdef".to_vec())).await.unwrap();
        drop(tx);
        task.await.unwrap();

        let (_, commands) = store.session_detail("s1").await.unwrap().unwrap();
        assert!(commands[0].output.starts_with("01234567"));
        assert!(commands[0].output.ends_with("[output truncated]"));
    }
}
