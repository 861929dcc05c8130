//! Common error types for Satchel.

use thiserror::Error;

use crate::types::ContentId;

/// Top-level error type for Satchel operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport-level failure talking to the remote. Retryable.
    #[error("Network error: {0}")]
    Network(String),

    /// A transferred package failed size or checksum verification.
    /// The partial write is discarded; nothing is committed.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// An attempt to record a version older than what is already stored.
    #[error("Version regression for {content_id}: stored {stored}, offered {offered}")]
    VersionRegression {
        content_id: ContentId,
        stored: u64,
        offered: u64,
    },

    /// The server reported that the mutation's base state has since
    /// changed remotely. Requires explicit resolution by the caller.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The server rejected a mutation as invalid. Terminal for that mutation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Storage adapter operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Whether a failed operation may succeed if tried again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Io(_))
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
