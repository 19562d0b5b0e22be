//! Relay error types.

use thiserror::Error;

/// Offline queue and message log failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A live handle could not accept a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The session behind the handle has gone away.
    #[error("connection closed")]
    Closed,
    /// The session is not draining its outbound buffer.
    #[error("outbound buffer full")]
    Full,
}

/// Inbound frame could not be decoded.
#[derive(Debug, Error)]
#[error("malformed frame: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

/// Identity could not be established for an upgrade request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing authentication token")]
    MissingToken,
    #[error("malformed token")]
    Malformed,
    #[error("invalid token signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("token has no user_id claim")]
    MissingClaim,
}
