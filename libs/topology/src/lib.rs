//! Overlay Topology
//!
//! Per-process view of the network shape. The only concrete topology is an
//! (optionally incomplete) hypercube: nodes are labeled 0..N, two labels are
//! neighbors iff they differ in exactly one bit, and broadcast/scatter are
//! driven by a control word - a bitmask over link indices encoding which
//! links still owe a forwarded copy.
//!
//! This crate is pure routing math. It tracks which neighbor labels have an
//! attached connection but never owns the connections themselves; those stay
//! with the server node.
//!
//! The broadcast pruning follows Katseff, "Incomplete Hypercubes", IEEE
//! Trans. on Computers Vol. 37 No. 5.

pub mod hypercube;

pub use hypercube::{ceil_log2, linkup_label, Hypercube, ScatterRoute};

/// Topology kind discriminant carried in server-info exchanges.
pub const NETWORK_HYPERCUBE: u32 = 1;
