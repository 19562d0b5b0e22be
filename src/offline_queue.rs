//! Offline Queue
//!
//! Per-recipient FIFO of messages for users who were offline when a message
//! was routed. Each recipient's queue lives under the key
//! `offline:<recipient id>` and carries a single time-to-live that is pushed
//! out to `now + retention` on every enqueue. A queue whose TTL has passed is
//! treated as absent: it drains as empty and a later enqueue starts fresh.
//!
//! Entries are the serialized outbound JSON of each message. A drain returns
//! them in enqueue order and leaves the queue empty.
//!
//! [`MemoryOfflineQueue`] locks each recipient separately, so unrelated
//! recipients never contend. [`SqliteOfflineQueue`] does not: every
//! recipient shares one connection behind a mutex, so enqueues and drains for
//! different users serialize on it. Per-recipient work on SQLite needs a
//! connection pool.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use crate::clock::Clock;
use crate::error::StorageError;
use crate::message::{ChatMessage, UserId};
use crate::storage::{database_path, open_sqlite, StorageBackend};

/// Default retention for undelivered messages (7 days).
pub const DEFAULT_OFFLINE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Store key for a recipient's queue.
pub fn queue_key(recipient: UserId) -> String {
    format!("offline:{}", recipient)
}

/// Trait for offline queue backends.
pub trait OfflineQueue: Send + Sync {
    /// Appends a message to its recipient's queue and refreshes the queue TTL.
    ///
    /// Returns the number of expired entries discarded to start a fresh queue.
    fn enqueue(&self, msg: &ChatMessage) -> Result<usize, StorageError>;

    /// Removes and returns every pending message for a recipient, oldest first.
    ///
    /// A missing or expired queue yields an empty list.
    fn drain(&self, recipient: UserId) -> Result<Vec<ChatMessage>, StorageError>;

    /// Removes all expired queues. Returns the number of messages discarded.
    fn cleanup_expired(&self) -> usize;

    /// Returns the total number of queued messages.
    fn message_count(&self) -> usize;

    /// Returns the number of recipients with a pending queue.
    fn recipient_count(&self) -> usize;
}

fn decode_payloads(recipient: UserId, payloads: Vec<String>) -> Vec<ChatMessage> {
    payloads
        .into_iter()
        .filter_map(|payload| match ChatMessage::from_json(&payload) {
            Ok(msg) => Some(msg),
            Err(e) => {
                warn!("Dropping undecodable offline entry for {}: {}", recipient, e);
                None
            }
        })
        .collect()
}

// ============================================================================
// In-Memory Queue (for testing and development)
// ============================================================================

#[derive(Default)]
struct RecipientQueue {
    payloads: VecDeque<String>,
    expires_at_secs: u64,
    /// Set once the queue has been drained or expired out of the map.
    retired: bool,
}

/// In-memory queue. Each recipient has its own lock so unrelated recipients
/// only share the brief map lookup.
pub struct MemoryOfflineQueue {
    queues: RwLock<HashMap<UserId, Arc<Mutex<RecipientQueue>>>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl MemoryOfflineQueue {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        MemoryOfflineQueue {
            queues: RwLock::new(HashMap::new()),
            ttl,
            clock,
        }
    }

    fn queue_for(&self, recipient: UserId) -> Arc<Mutex<RecipientQueue>> {
        if let Some(queue) = self
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&recipient)
        {
            return queue.clone();
        }
        self.queues
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(recipient)
            .or_default()
            .clone()
    }
}

impl OfflineQueue for MemoryOfflineQueue {
    fn enqueue(&self, msg: &ChatMessage) -> Result<usize, StorageError> {
        let payload = msg.to_json()?;
        let now = self.clock.now_secs();

        loop {
            let queue = self.queue_for(msg.recipient);
            let mut queue = queue.lock().unwrap_or_else(PoisonError::into_inner);
            if queue.retired {
                // Drained between lookup and lock; pick up the replacement.
                continue;
            }
            let mut discarded = 0;
            if !queue.payloads.is_empty() && now >= queue.expires_at_secs {
                discarded = queue.payloads.len();
                queue.payloads.clear();
            }
            queue.payloads.push_back(payload);
            queue.expires_at_secs = now.saturating_add(self.ttl.as_secs());
            return Ok(discarded);
        }
    }

    fn drain(&self, recipient: UserId) -> Result<Vec<ChatMessage>, StorageError> {
        let removed = self
            .queues
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&recipient);

        let Some(queue) = removed else {
            return Ok(Vec::new());
        };

        let mut queue = queue.lock().unwrap_or_else(PoisonError::into_inner);
        queue.retired = true;
        if self.clock.now_secs() >= queue.expires_at_secs {
            return Ok(Vec::new());
        }
        let payloads: Vec<String> = queue.payloads.drain(..).collect();
        Ok(decode_payloads(recipient, payloads))
    }

    fn cleanup_expired(&self) -> usize {
        let now = self.clock.now_secs();
        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0;

        queues.retain(|_, queue| {
            let mut queue = queue.lock().unwrap_or_else(PoisonError::into_inner);
            if now >= queue.expires_at_secs {
                removed += queue.payloads.len();
                queue.payloads.clear();
                queue.retired = true;
                false
            } else {
                true
            }
        });

        removed
    }

    fn message_count(&self) -> usize {
        let queues = self.queues.read().unwrap_or_else(PoisonError::into_inner);
        queues
            .values()
            .map(|q| q.lock().unwrap_or_else(PoisonError::into_inner).payloads.len())
            .sum()
    }

    fn recipient_count(&self) -> usize {
        let queues = self.queues.read().unwrap_or_else(PoisonError::into_inner);
        queues
            .values()
            .filter(|q| {
                !q.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .payloads
                    .is_empty()
            })
            .count()
    }
}

// ============================================================================
// SQLite Queue (for production)
// ============================================================================

/// SQLite-backed durable queue.
pub struct SqliteOfflineQueue {
    conn: Mutex<Connection>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl SqliteOfflineQueue {
    /// Opens or creates a queue database at the given path.
    pub fn open<P: AsRef<Path>>(
        path: P,
        ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StorageError> {
        let conn = open_sqlite(path)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS offline_queues (
                queue_key TEXT PRIMARY KEY,
                expires_at_secs INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS offline_messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                queue_key TEXT NOT NULL,
                payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_offline_messages_key
                ON offline_messages(queue_key, seq);
            CREATE INDEX IF NOT EXISTS idx_offline_queues_expiry
                ON offline_queues(expires_at_secs);",
        )?;

        Ok(SqliteOfflineQueue {
            conn: Mutex::new(conn),
            ttl,
            clock,
        })
    }

    /// Creates a queue backed by an in-memory SQLite database.
    pub fn in_memory(ttl: Duration, clock: Arc<dyn Clock>) -> Result<Self, StorageError> {
        Self::open(":memory:", ttl, clock)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl OfflineQueue for SqliteOfflineQueue {
    fn enqueue(&self, msg: &ChatMessage) -> Result<usize, StorageError> {
        let payload = msg.to_json()?;
        let key = queue_key(msg.recipient);
        let now = self.clock.now_secs() as i64;
        let expires_at = now.saturating_add(self.ttl.as_secs() as i64);

        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let current: Option<i64> = tx
            .query_row(
                "SELECT expires_at_secs FROM offline_queues WHERE queue_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        let discarded = if matches!(current, Some(expiry) if now >= expiry) {
            tx.execute(
                "DELETE FROM offline_messages WHERE queue_key = ?1",
                params![key],
            )?
        } else {
            0
        };

        tx.execute(
            "INSERT INTO offline_messages (queue_key, payload) VALUES (?1, ?2)",
            params![key, payload],
        )?;
        tx.execute(
            "INSERT INTO offline_queues (queue_key, expires_at_secs) VALUES (?1, ?2)
             ON CONFLICT(queue_key) DO UPDATE SET expires_at_secs = excluded.expires_at_secs",
            params![key, expires_at],
        )?;

        tx.commit()?;
        Ok(discarded)
    }

    fn drain(&self, recipient: UserId) -> Result<Vec<ChatMessage>, StorageError> {
        let key = queue_key(recipient);
        let now = self.clock.now_secs() as i64;

        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let expiry: Option<i64> = tx
            .query_row(
                "SELECT expires_at_secs FROM offline_queues WHERE queue_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        let payloads = match expiry {
            Some(expires_at) if now < expires_at => {
                let mut stmt = tx.prepare(
                    "SELECT payload FROM offline_messages
                     WHERE queue_key = ?1 ORDER BY seq ASC",
                )?;
                let rows = stmt
                    .query_map(params![key], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            _ => Vec::new(),
        };

        tx.execute(
            "DELETE FROM offline_messages WHERE queue_key = ?1",
            params![key],
        )?;
        tx.execute(
            "DELETE FROM offline_queues WHERE queue_key = ?1",
            params![key],
        )?;
        tx.commit()?;

        Ok(decode_payloads(recipient, payloads))
    }

    fn cleanup_expired(&self) -> usize {
        let now = self.clock.now_secs() as i64;
        let conn = self.lock();

        let removed = conn
            .execute(
                "DELETE FROM offline_messages WHERE queue_key IN
                    (SELECT queue_key FROM offline_queues WHERE expires_at_secs <= ?1)",
                params![now],
            )
            .unwrap_or_else(|e| {
                warn!("Offline queue cleanup failed: {}", e);
                0
            });
        if let Err(e) = conn.execute(
            "DELETE FROM offline_queues WHERE expires_at_secs <= ?1",
            params![now],
        ) {
            warn!("Offline queue cleanup failed: {}", e);
        }

        removed
    }

    fn message_count(&self) -> usize {
        let conn = self.lock();
        conn.query_row("SELECT COUNT(*) FROM offline_messages", [], |row| {
            row.get::<_, i64>(0)
        })
        .unwrap_or(0) as usize
    }

    fn recipient_count(&self) -> usize {
        let conn = self.lock();
        conn.query_row(
            "SELECT COUNT(DISTINCT queue_key) FROM offline_messages",
            [],
            |row| row.get::<_, i64>(0),
        )
        .unwrap_or(0) as usize
    }
}

// ============================================================================
// Queue Factory
// ============================================================================

/// Creates an offline queue for the configured backend.
pub fn create_offline_queue(
    backend: StorageBackend,
    data_dir: Option<&Path>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
) -> Result<Box<dyn OfflineQueue>, StorageError> {
    match backend {
        StorageBackend::Memory => Ok(Box::new(MemoryOfflineQueue::new(ttl, clock))),
        StorageBackend::Sqlite => {
            let path = database_path(data_dir, "offline_queue.db");
            Ok(Box::new(SqliteOfflineQueue::open(path, ttl, clock)?))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
