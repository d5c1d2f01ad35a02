//! Wire codec error types.

use thiserror::Error;

/// Errors produced while encoding or decoding a wire message.
#[derive(Error, Debug)]
pub enum WireError {
    /// Buffer too short for the field being read.
    #[error("truncated message: need {needed} bytes, have {got}")]
    Truncated { needed: usize, got: usize },

    /// Unknown message class byte.
    #[error("invalid message class {0}")]
    BadClass(u8),

    /// Unknown routing kind byte.
    #[error("invalid routing kind {0}")]
    BadRoutingKind(u8),

    /// Declared payload length exceeds the hard ceiling.
    #[error("payload length {len} exceeds ceiling {max}")]
    PayloadTooLarge { len: u64, max: u64 },
}

pub type Result<T> = std::result::Result<T, WireError>;
