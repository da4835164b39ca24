//! Error types for the storage layer.

use thiserror::Error;

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Document or file not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency check failed.
    #[error("revision conflict: {0}")]
    Conflict(String),

    /// Invalid data.
    #[error("invalid data: {0}")]
    InvalidData(String),
}
