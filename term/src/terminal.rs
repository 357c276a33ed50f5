//! Terminal handling: raw mode plus verbatim byte passthrough.
//!
//! Shell output bytes go straight to stdout; the remote PTY does the
//! rendering. Raw mode is enabled on creation and restored on drop, so
//! teardown paths (including panics unwinding through the controller) leave
//! the terminal usable.

use std::io::{self, Write};

use crossterm::terminal::{disable_raw_mode, enable_raw_mode};

/// The one terminal instance a controller may own.
pub struct TerminalWidget {
    raw: bool,
}

impl TerminalWidget {
    /// Enter raw mode and take ownership of the terminal.
    pub fn new() -> io::Result<Self> {
        enable_raw_mode()?;
        Ok(Self { raw: true })
    }

    /// Write shell output exactly as received.
    pub fn write_bytes(&mut self, data: &[u8]) -> io::Result<()> {
        let mut stdout = io::stdout();
        stdout.write_all(data)?;
        stdout.flush()
    }

    /// Write an out-of-band notice on its own line (status messages,
    /// warnings). Uses `\r\n` explicitly since the terminal is raw.
    pub fn notice(&mut self, message: &str) {
        let mut stdout = io::stdout();
        let _ = write!(stdout, "\r\n[sshgate] {message}\r\n");
        let _ = stdout.flush();
    }
}

impl Drop for TerminalWidget {
    fn drop(&mut self) {
        if self.raw {
            let _ = disable_raw_mode();
        }
    }
}
