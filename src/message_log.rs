//! Message Log
//!
//! Append-only history of every routed message, written once per message
//! whatever happened to its delivery.
//!
//! [`SqliteMessageLog`] serializes all appends on a single connection, so
//! logging for unrelated conversations contends on one mutex.

use std::path::Path;
use std::sync::{Mutex, PoisonError, RwLock};

use rusqlite::{params, Connection};

use crate::error::StorageError;
use crate::message::{ChatMessage, UserId};
use crate::storage::{database_path, open_sqlite, StorageBackend};

/// Trait for message log backends.
pub trait MessageLog: Send + Sync {
    /// Appends a message. Returns the new row id.
    fn append(&self, msg: &ChatMessage) -> Result<i64, StorageError>;

    /// Returns up to `limit` of the most recent messages exchanged between two
    /// users, oldest first.
    fn conversation(
        &self,
        a: UserId,
        b: UserId,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StorageError>;

    /// Returns the number of logged messages.
    fn count(&self) -> usize;
}

fn between(msg: &ChatMessage, a: UserId, b: UserId) -> bool {
    (msg.sender == a && msg.recipient == b) || (msg.sender == b && msg.recipient == a)
}

/// In-memory log.
#[derive(Default)]
pub struct MemoryMessageLog {
    rows: RwLock<Vec<ChatMessage>>,
}

impl MemoryMessageLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageLog for MemoryMessageLog {
    fn append(&self, msg: &ChatMessage) -> Result<i64, StorageError> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        rows.push(msg.clone());
        Ok(rows.len() as i64)
    }

    fn conversation(
        &self,
        a: UserId,
        b: UserId,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StorageError> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        let mut recent: Vec<ChatMessage> = rows
            .iter()
            .rev()
            .filter(|m| between(m, a, b))
            .take(limit)
            .cloned()
            .collect();
        recent.reverse();
        Ok(recent)
    }

    fn count(&self) -> usize {
        self.rows.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// SQLite-backed log.
pub struct SqliteMessageLog {
    conn: Mutex<Connection>,
}

impl SqliteMessageLog {
    /// Opens or creates a log database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let conn = open_sqlite(path)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS chat_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sender_id INTEGER NOT NULL,
                receiver_id INTEGER NOT NULL,
                content TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_chat_messages_sender ON chat_messages(sender_id);
            CREATE INDEX IF NOT EXISTS idx_chat_messages_receiver ON chat_messages(receiver_id);
            CREATE INDEX IF NOT EXISTS idx_chat_messages_created ON chat_messages(created_at);",
        )?;

        Ok(SqliteMessageLog {
            conn: Mutex::new(conn),
        })
    }

    /// Creates a log backed by an in-memory SQLite database.
    pub fn in_memory() -> Result<Self, StorageError> {
        Self::open(":memory:")
    }
}

impl MessageLog for SqliteMessageLog {
    fn append(&self, msg: &ChatMessage) -> Result<i64, StorageError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute(
            "INSERT INTO chat_messages (sender_id, receiver_id, content, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![msg.sender, msg.recipient, msg.content, msg.sent_at as i64],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn conversation(
        &self,
        a: UserId,
        b: UserId,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StorageError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn.prepare(
            "SELECT sender_id, receiver_id, content, created_at FROM chat_messages
             WHERE (sender_id = ?1 AND receiver_id = ?2)
                OR (sender_id = ?2 AND receiver_id = ?1)
             ORDER BY created_at DESC, id DESC
             LIMIT ?3",
        )?;

        let mut rows = stmt
            .query_map(params![a, b, limit as i64], |row| {
                Ok(ChatMessage {
                    sender: row.get(0)?,
                    recipient: row.get(1)?,
                    content: row.get(2)?,
                    sent_at: row.get::<_, i64>(3)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.reverse();
        Ok(rows)
    }

    fn count(&self) -> usize {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.query_row("SELECT COUNT(*) FROM chat_messages", [], |row| {
            row.get::<_, i64>(0)
        })
        .unwrap_or(0) as usize
    }
}

/// Creates a message log for the configured backend.
pub fn create_message_log(
    backend: StorageBackend,
    data_dir: Option<&Path>,
) -> Result<Box<dyn MessageLog>, StorageError> {
    match backend {
        StorageBackend::Memory => Ok(Box::new(MemoryMessageLog::new())),
        StorageBackend::Sqlite => {
            let path = database_path(data_dir, "messages.db");
            Ok(Box::new(SqliteMessageLog::open(path)?))
        }
    }
}
