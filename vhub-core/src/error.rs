//! Domain-specific error types for the VideoHub protocol engine.
//!
//! All fallible operations return `Result<T, HubError>`.
//! Malformed device input never panics: every failure is typed and
//! recoverable.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the VideoHub client.
#[derive(Debug, Error)]
pub enum HubError {
    // ── Decode Errors ────────────────────────────────────────────
    /// A frame contained bytes outside the ASCII range.
    #[error("frame is not ASCII text")]
    NonAscii,

    /// No frame delimiter was found within the codec limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    // ── Protocol Errors ──────────────────────────────────────────
    /// An `ACK`/`NAK` arrived while no command was in flight.
    #[error("unexpected {} with no command in flight", ack_word(.success))]
    UnexpectedAck { success: bool },

    /// A connection state transition was requested from the wrong state.
    #[error("invalid state transition: {0}")]
    InvalidTransition(&'static str),

    // ── Command Errors ───────────────────────────────────────────
    /// A command could not be rendered as a wire frame.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// The device answered a command with `NAK`.
    #[error("device rejected {title} command")]
    Rejected { title: String },

    /// The connection went away before the command was acknowledged.
    #[error("connection lost before acknowledgement")]
    ConnectionLost,

    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// Every connect attempt failed.
    #[error("failed to connect after {attempts} attempts")]
    ConnectFailed { attempts: u32 },

    /// An operation needed a live connection.
    #[error("not connected")]
    NotConnected,

    /// The receive loop currently owns the read half of the socket.
    #[error("receive loop is reading from this connection")]
    ReaderBusy,

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),
}

fn ack_word(success: &bool) -> &'static str {
    if *success { "ACK" } else { "NAK" }
}

// ── Convenient From implementations ──────────────────────────────

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for HubError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        HubError::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = HubError::FrameTooLarge {
            size: 70_000,
            max: 65_536,
        };
        assert!(e.to_string().contains("70000"));
        assert!(e.to_string().contains("65536"));

        let e = HubError::UnexpectedAck { success: false };
        assert_eq!(e.to_string(), "unexpected NAK with no command in flight");

        let e = HubError::Rejected {
            title: "VIDEO OUTPUT ROUTING".into(),
        };
        assert!(e.to_string().contains("VIDEO OUTPUT ROUTING"));
    }

    #[test]
    fn from_closed_channel() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<u8>();
        drop(rx);
        let e: HubError = tx.send(1).unwrap_err().into();
        assert!(matches!(e, HubError::ChannelClosed));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: HubError = io_err.into();
        assert!(matches!(e, HubError::Connection(_)));
    }
}
