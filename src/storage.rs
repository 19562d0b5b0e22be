//! Storage Backends
//!
//! Shared plumbing for the offline queue and the message log: backend
//! selection and SQLite connection setup.

use std::path::{Path, PathBuf};

use rusqlite::Connection;

/// Storage backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageBackend {
    /// In-memory storage (lost on restart).
    Memory,
    /// SQLite persistent storage.
    #[default]
    Sqlite,
}

impl StorageBackend {
    /// Parses a backend name; anything but `memory` selects SQLite.
    pub fn from_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "memory" => StorageBackend::Memory,
            _ => StorageBackend::Sqlite,
        }
    }
}

/// Opens a SQLite database tuned for many short concurrent writes.
pub fn open_sqlite<P: AsRef<Path>>(path: P) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open(path)?;

    // WAL lets readers proceed while a writer holds the lock
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         PRAGMA cache_size=10000;",
    )?;

    Ok(conn)
}

/// Resolves a database file under the data directory, creating the directory.
pub fn database_path(data_dir: Option<&Path>, file_name: &str) -> PathBuf {
    let path = data_dir
        .map(|d| d.join(file_name))
        .unwrap_or_else(|| PathBuf::from(file_name));

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    path
}
