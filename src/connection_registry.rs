// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Connection Registry
//!
//! Tracks which session currently owns each online user so the router can
//! hand messages to a live connection instead of the offline queue.
//!
//! Each user maps to at most one [`ConnectionHandle`]. Registering again for
//! the same user replaces the entry; the replaced session is not closed here.
//! Its receiver sees the channel close once the registry drops the sender,
//! and the session shuts itself down. Removal is conditional on the session
//! identity so a late teardown of an old session cannot evict its successor.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::error::DeliveryError;
use crate::message::{ChatMessage, UserId};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outbound side of a live session.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    session: SessionId,
    tx: mpsc::Sender<ChatMessage>,
}

impl ConnectionHandle {
    /// Creates a handle with a fresh session id and the receiver the session
    /// drains into its socket.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ChatMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            ConnectionHandle {
                session: SessionId::next(),
                tx,
            },
            rx,
        )
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Hands a message to the session.
    ///
    /// A closed session fails at once. A full buffer is backpressure: the
    /// caller blocks for up to `wait` while the session catches up, and only
    /// gets [`DeliveryError::Full`] if no space frees in time. Call this from
    /// a blocking context, never from an async task.
    pub fn deliver(&self, msg: ChatMessage, wait: Duration) -> Result<(), DeliveryError> {
        let deadline = Instant::now() + wait;
        let mut backoff = Duration::from_millis(1);
        let mut msg = msg;
        loop {
            match self.tx.try_send(msg) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Closed(_)) => return Err(DeliveryError::Closed),
                Err(TrySendError::Full(returned)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(DeliveryError::Full);
                    }
                    std::thread::sleep(backoff.min(deadline - now));
                    backoff = (backoff * 2).min(Duration::from_millis(20));
                    msg = returned;
                }
            }
        }
    }
}

/// Thread-safe map of online users to their current session.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<UserId, ConnectionHandle>>,
}

impl ConnectionRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        ConnectionRegistry {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Registers `handle` as the live session for `user_id`.
    ///
    /// Returns the session that was superseded, if any.
    pub fn register(&self, user_id: UserId, handle: ConnectionHandle) -> Option<SessionId> {
        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        connections
            .insert(user_id, handle)
            .map(|old| old.session)
    }

    /// Returns the current live handle for a user.
    pub fn lookup(&self, user_id: UserId) -> Option<ConnectionHandle> {
        let connections = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        connections.get(&user_id).cloned()
    }

    /// Removes the entry for `user_id` only if it still belongs to `session`.
    pub fn deregister(&self, user_id: UserId, session: SessionId) -> bool {
        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match connections.get(&user_id) {
            Some(current) if current.session == session => {
                connections.remove(&user_id);
                true
            }
            _ => false,
        }
    }

    /// Returns the number of currently connected users.
    pub fn connected_count(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
