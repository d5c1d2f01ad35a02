//! Wire Message Envelope
//!
//! The framed envelope every control-plane message travels in: a message
//! class, a routing kind, a one-byte admin command, a five-word control
//! block, and an opaque length-prefixed payload. This crate ONLY handles:
//! - Serializing and deserializing the envelope
//! - Header-only peeks used by the routing hot path
//! - The in-place relay rewrite applied on every forwarded hop
//!
//! It does NOT handle transport framing (length prefix on the stream - that
//! belongs to the channel layer) or admin-command semantics (overlay layer).

pub mod error;
pub mod message;

pub use error::{Result, WireError};
pub use message::{
    peek_class, peek_command, peek_destination, peek_relay, peek_routing, peek_source, set_relay,
    ControlBlock, Message, MessageClass, RoutingKind, HEADER_LEN, PAYLOAD_HARD_CEILING,
    PAYLOAD_WARN_CEILING,
};
