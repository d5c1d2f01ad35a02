//! Transport error types.

use thiserror::Error;

/// Errors produced by channel operations.
///
/// Transport-level failures (`Closed`, `ConnectionLost`) cause the owning
/// channel to close itself; the routing layer drops the peer and keeps
/// operating on the remaining graph.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The channel is not open (or the peer shut down cleanly).
    #[error("channel closed")]
    Closed,

    /// The connection dropped mid-transfer (reset, broken pipe).
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// A time-bounded operation did not complete in time.
    #[error("{operation} timed out after {timeout_ms}ms")]
    TimedOut {
        operation: &'static str,
        timeout_ms: u64,
    },

    /// The peer violated the framing protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Malformed wire message.
    #[error("invalid message: {0}")]
    InvalidMessage(#[from] wire::WireError),

    /// Any other I/O failure.
    #[error("i/o error: {0}")]
    Io(std::io::Error),
}

pub type Result<T> = std::result::Result<T, ChannelError>;

impl ChannelError {
    /// Whether retrying the operation could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChannelError::TimedOut { .. } | ChannelError::ConnectionLost(_)
        )
    }

    pub fn timeout(operation: &'static str, timeout: std::time::Duration) -> Self {
        ChannelError::TimedOut {
            operation,
            timeout_ms: timeout.as_millis() as u64,
        }
    }
}

impl From<std::io::Error> for ChannelError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::UnexpectedEof => ChannelError::Closed,
            ErrorKind::ConnectionReset | ErrorKind::BrokenPipe | ErrorKind::ConnectionAborted => {
                ChannelError::ConnectionLost(err.to_string())
            }
            ErrorKind::TimedOut => ChannelError::TimedOut {
                operation: "io",
                timeout_ms: 0,
            },
            _ => ChannelError::Io(err),
        }
    }
}
