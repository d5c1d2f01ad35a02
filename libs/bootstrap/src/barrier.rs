//! Intra-host fetch-and-add barrier.
//!
//! Layered under the network-wide synchronize: participants on one host
//! spin on a shared counter. Each handle tracks its own release count, so
//! the same barrier can be entered repeatedly without resetting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub struct LocalBarrier {
    counter: Arc<AtomicU64>,
    comm_size: u64,
    release: u64,
}

impl LocalBarrier {
    /// A barrier over `comm_size` participants. Clone one handle per
    /// participant.
    pub fn new(comm_size: usize) -> Self {
        Self {
            counter: Arc::new(AtomicU64::new(0)),
            comm_size: comm_size as u64,
            release: 0,
        }
    }

    /// Enter the barrier and spin until every participant has arrived.
    pub fn enter(&mut self) {
        self.release += self.comm_size;
        self.counter.fetch_add(1, Ordering::SeqCst);
        while self.counter.load(Ordering::SeqCst) < self.release {
            std::hint::spin_loop();
        }
    }
}

impl Clone for LocalBarrier {
    fn clone(&self) -> Self {
        Self {
            counter: Arc::clone(&self.counter),
            comm_size: self.comm_size,
            release: self.release,
        }
    }
}
