//! Session error taxonomy.
//!
//! Validation and remote-shell errors are reported once to the client over
//! the transport; persistence errors are logged and swallowed by the audit
//! path and never reach here.

use thiserror::Error;

/// Errors surfaced to the client for a connect attempt or live session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A required connect field is missing or the requesting user cannot be
    /// resolved. No session is created.
    #[error("invalid connect request: {0}")]
    Validation(String),

    /// The remote shell could not be opened (unreachable host, auth
    /// failure). Terminal for the attempt; retry is the client's call.
    #[error("failed to open remote shell: {0}")]
    ShellOpen(String),

    /// The remote shell stream faulted after a successful open.
    #[error("remote shell error: {0}")]
    Shell(String),

    /// The client transport dropped or refused a write.
    #[error("transport error: {0}")]
    Transport(String),
}

impl SessionError {
    /// Wire error code carried in `error` messages.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION",
            Self::ShellOpen(_) => "SHELL_OPEN_FAILED",
            Self::Shell(_) => "SHELL_ERROR",
            Self::Transport(_) => "TRANSPORT",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(SessionError::Validation("x".into()).code(), "VALIDATION");
        assert_eq!(SessionError::ShellOpen("x".into()).code(), "SHELL_OPEN_FAILED");
        assert_eq!(SessionError::Shell("x".into()).code(), "SHELL_ERROR");
        assert_eq!(SessionError::Transport("x".into()).code(), "TRANSPORT");
    }
}
