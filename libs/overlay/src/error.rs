//! Overlay protocol error types.

use thiserror::Error;

/// Errors surfaced by the overlay layer.
#[derive(Error, Debug)]
pub enum OverlayError {
    #[error(transparent)]
    Channel(#[from] channel::ChannelError),

    #[error(transparent)]
    Wire(#[from] wire::WireError),

    /// Operation requires a linked topology node and none exists yet.
    #[error("overlay network is not linked")]
    NotLinked,

    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, OverlayError>;
