//! Storage error types.

use thiserror::Error;

/// Errors from the persistence gateway.
///
/// Every variant is reported to the sender as a delivery failure; none of
/// them is retried by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// Underlying store failed (disk, transaction, lock).
    #[error("storage I/O error: {0}")]
    Io(String),

    /// Stored bytes could not be encoded or decoded.
    #[error("storage serialization error: {0}")]
    Serialization(String),
}
