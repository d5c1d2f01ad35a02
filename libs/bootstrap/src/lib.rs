//! Session & Bootstrap Manager
//!
//! The top-level per-process object of a job launch. Daemons authenticate
//! to the root over the INITMSG/INITOK handshake, the root assigns host
//! ranks and seeds the overlay linkup at rank 0, and both sides keep using
//! the tagged session services (typed pack/unpack buffers, send/receive/
//! broadcast, a simple allgather and barrier) over the same connections.
//!
//! The intra-host [`LocalBarrier`] layers under the network-wide
//! synchronize provided by the overlay.

pub mod barrier;
pub mod buffer;
pub mod error;
pub mod session;

pub use barrier::LocalBarrier;
pub use buffer::{PackBuffer, UnpackBuffer};
pub use error::{PeerDiag, Result, SessionError};
pub use session::{
    tags, Role, Session, SessionConfig, UNKNOWN_HOST_RANK, UNKNOWN_PROCESS_COUNT,
};
