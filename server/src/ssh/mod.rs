//! Remote shell client — opens a credentialed SSH shell and exposes it as a
//! byte-oriented duplex stream.
//!
//! [`RemoteShell::open`] dials the target, authenticates with the supplied
//! password credential, and requests a PTY + shell on one session channel.
//! The channel is split: the write half is wrapped in [`ShellWriter`] for
//! keystroke delivery, the read half is drained by a background task that
//! forwards output chunks (and the close/error signal) into an mpsc channel
//! consumed by the session lifecycle manager.

use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, AuthResult};
use russh::keys::PublicKey;
use russh::{ChannelMsg, ChannelWriteHalf, Disconnect};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::SessionError;

/// Connection parameters for one shell-open attempt.
#[derive(Debug, Clone)]
pub struct ShellParams {
    pub host: String,
    pub port: u16,
    pub login: String,
    pub credential: String,
    pub term: String,
    pub rows: u16,
    pub cols: u16,
    pub connect_timeout: Duration,
}

/// Events produced by the shell's read side, in arrival order.
#[derive(Debug)]
pub enum ShellEvent {
    /// An output chunk, exactly as received (stdout and stderr merged by the
    /// remote PTY).
    Output(Vec<u8>),
    /// The remote closed the stream (EOF or channel close).
    Closed,
    /// The stream faulted.
    Error(String),
}

/// Accepts any server host key. The proxy connects to operator-registered
/// hosts on behalf of users; host-key pinning lives in the inventory layer.
struct AcceptingHandler;

impl client::Handler for AcceptingHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Write handle for sending keystrokes to the shell channel.
///
/// Wraps the channel write half so input forwarding never contends with the
/// background reader.
pub struct ShellWriter {
    write_half: ChannelWriteHalf<client::Msg>,
}

impl ShellWriter {
    /// Send raw bytes (keystrokes, escape sequences) to the shell.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        self.write_half
            .data(data)
            .await
            .map_err(|e| SessionError::Shell(format!("shell write failed: {e}")))
    }

    /// Close the channel gracefully.
    pub async fn close(&self) {
        if let Err(e) = self.write_half.close().await {
            debug!("Shell channel close: {e}");
        }
    }
}

/// An open remote shell: writer handle plus teardown state. The output side
/// is handed back separately as an event receiver so the caller can move it
/// into its own forwarding task.
pub struct RemoteShell {
    pub writer: ShellWriter,
    cancel: CancellationToken,
    // Keeps the SSH connection alive for the shell's lifetime.
    handle: client::Handle<AcceptingHandler>,
}

impl RemoteShell {
    /// Open an interactive shell on the target host.
    ///
    /// Fails with [`SessionError::ShellOpen`] on unreachable host, timeout,
    /// rejected credentials, or channel setup failure — reported once to the
    /// caller, never retried here.
    pub async fn open(
        params: ShellParams,
    ) -> Result<(Self, mpsc::Receiver<ShellEvent>), SessionError> {
        let config = Arc::new(client::Config {
            inactivity_timeout: None,
            ..Default::default()
        });

        let connect = client::connect(
            config,
            (params.host.as_str(), params.port),
            AcceptingHandler,
        );
        let mut handle = tokio::time::timeout(params.connect_timeout, connect)
            .await
            .map_err(|_| {
                SessionError::ShellOpen(format!(
                    "connection to {}:{} timed out",
                    params.host, params.port
                ))
            })?
            .map_err(|e| {
                SessionError::ShellOpen(format!(
                    "connection to {}:{} failed: {e}",
                    params.host, params.port
                ))
            })?;

        match handle
            .authenticate_password(params.login.as_str(), params.credential.as_str())
            .await
        {
            Ok(AuthResult::Success) => {}
            Ok(AuthResult::Failure { .. }) => {
                return Err(SessionError::ShellOpen(format!(
                    "authentication failed for {}@{}",
                    params.login, params.host
                )));
            }
            Err(e) => {
                return Err(SessionError::ShellOpen(format!(
                    "authentication error for {}@{}: {e}",
                    params.login, params.host
                )));
            }
        }

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| SessionError::ShellOpen(format!("channel open failed: {e}")))?;

        channel
            .request_pty(
                false,
                &params.term,
                u32::from(params.cols),
                u32::from(params.rows),
                0,
                0,
                &[],
            )
            .await
            .map_err(|e| SessionError::ShellOpen(format!("PTY request failed: {e}")))?;

        channel
            .request_shell(true)
            .await
            .map_err(|e| SessionError::ShellOpen(format!("shell request failed: {e}")))?;

        let (mut read_half, write_half) = channel.split();
        let cancel = CancellationToken::new();

        // Reader task: shell output → event channel. Bounded so a stalled
        // consumer applies backpressure here, not across connections.
        let (event_tx, event_rx) = mpsc::channel::<ShellEvent>(256);
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    () = reader_cancel.cancelled() => break,
                    msg = read_half.wait() => msg,
                };
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        if event_tx.send(ShellEvent::Output(data.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Some(ChannelMsg::ExtendedData { data, .. }) => {
                        if event_tx.send(ShellEvent::Output(data.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        debug!("Remote shell exited with status {exit_status}");
                    }
                    Some(ChannelMsg::Eof | ChannelMsg::Close) | None => {
                        let _ = event_tx.send(ShellEvent::Closed).await;
                        break;
                    }
                    Some(other) => {
                        debug!("Ignoring channel message: {other:?}");
                    }
                }
            }
        });

        Ok((
            Self {
                writer: ShellWriter { write_half },
                cancel,
                handle,
            },
            event_rx,
        ))
    }

    /// Tear the shell down: stop the reader, close the channel, disconnect.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.writer.close().await;
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "session closed", "en")
            .await
        {
            warn!("SSH disconnect: {e}");
        }
    }
}
