//! Bootstrap and session error types.

use thiserror::Error;

/// One connected daemon, as reported in the handshake-timeout diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDiag {
    pub rank: i32,
    pub host: String,
    pub process_count: i32,
    pub pid: u32,
}

/// Errors surfaced by the session/bootstrap layer.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Channel(#[from] channel::ChannelError),

    #[error(transparent)]
    Overlay(#[from] overlay::OverlayError),

    /// Bad tag, bad length, malformed handshake field.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer's authentication triple does not match ours. From the
    /// root's perspective this is a misconfigured launch, not a transient
    /// failure.
    #[error("authentication data mismatch")]
    AuthMismatch,

    /// Two daemons claimed the same host rank.
    #[error("duplicate host rank {0}")]
    DuplicateRank(i32),

    /// A connecting daemon could not be matched against the host list.
    #[error("cannot resolve host rank for peer {0}")]
    UnknownHost(String),

    /// A buffer could not grow.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The aggregate handshake wall clock elapsed before every expected
    /// process checked in. Carries the roster of daemons that did connect,
    /// for operator diagnosis of partial failures.
    #[error("handshake timed out with {} daemons connected", connected.len())]
    HandshakeTimeout { connected: Vec<PeerDiag> },

    /// Unrecoverable, e.g. the initial listen socket cannot be created.
    #[error("fatal: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;
