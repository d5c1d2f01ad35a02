//! Overlay Protocol Layer
//!
//! The routing state machine and collective coordination that turn a set of
//! channels plus a topology node into a control-plane overlay:
//!
//! - [`ServerNode`] - a full overlay node: owns the topology node and the
//!   peer channels, routes on every message's routing kind, and coordinates
//!   the fan-in/fan-out collectives (allgather, allgatherv, synchronize,
//!   scatterv).
//! - [`ClientEndpoint`] - a thin attachment point for a process that is not
//!   a node but rides the same collectives.
//! - [`controller`] - the shared control-word framing both reuse.
//!
//! Linkup is bootstrap-only: a single seed message sent to label 0 assigns
//! labels, dials neighbors, and converges the whole graph (§ see
//! `ServerNode` internals).

pub mod admin;
pub mod client;
pub mod controller;
pub mod error;
pub mod server;

pub use admin::{
    linkup_message, parse_linkup, server_info_message, AdminCommand, ServerInfo, COLLECTIVE_SLOTS,
};
pub use client::ClientEndpoint;
pub use error::{OverlayError, Result};
pub use server::{ServerNode, SharedChannel};
