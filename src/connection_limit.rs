//! Connection Limiting
//!
//! Caps concurrent sessions so a connection flood cannot exhaust the process.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Largest connection limit the limiter can represent.
pub const MAX_CONNECTIONS_LIMIT: usize = Semaphore::MAX_PERMITS;

/// Hands out at most `max_connections` slots at a time.
#[derive(Clone)]
pub struct ConnectionLimiter {
    slots: Arc<Semaphore>,
    max_connections: usize,
}

/// Held for the life of a connection; dropping it frees the slot.
pub type ConnectionGuard = OwnedSemaphorePermit;

impl ConnectionLimiter {
    /// Values above [`MAX_CONNECTIONS_LIMIT`] are clamped to it.
    pub fn new(max_connections: usize) -> Self {
        let max_connections = max_connections.min(MAX_CONNECTIONS_LIMIT);
        ConnectionLimiter {
            slots: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        }
    }

    /// Takes a slot without waiting. `None` means the relay is full.
    pub fn try_acquire(&self) -> Option<ConnectionGuard> {
        self.slots.clone().try_acquire_owned().ok()
    }

    /// Returns the number of slots currently held.
    pub fn active_count(&self) -> usize {
        self.max_connections - self.slots.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}
