use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Flat error taxonomy for the whole crate.
///
/// The `Display` text leads with the error kind so the CLI can print errors
/// as a single `<kind>: <reason>` line.
#[derive(Error, Debug)]
pub enum Error {
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("transport error: report read timed out after {0:?}")]
    Timeout(Duration),

    #[error("packet error: {0}")]
    Packet(String),

    #[error("packet error: sequence mismatch (sent {sent:#04x}, got {got:#04x}); session must be reopened")]
    Desync { sent: u8, got: u8 },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("device error: non-zero status {status:#04x} replying to {command}")]
    Device { command: &'static str, status: u8 },

    #[error("decode error at offset {offset:#010x}: {reason}")]
    Decode { offset: u32, reason: String },

    #[error("usage error: {0}")]
    Usage(String),
}

impl Error {
    /// Whether the command layer may retry the command that produced this.
    ///
    /// Transport hiccups and corrupted packets are transient; a sequence
    /// mismatch means the session is desynchronised, and everything above
    /// the packet layer is deterministic.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Transport(_) | Error::Timeout(_) | Error::Packet(_)
        )
    }
}
