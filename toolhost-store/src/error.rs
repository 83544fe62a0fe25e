//! Error types for the storage layer.

use serde_json::Error as SerdeError;
use thiserror::Error;

/// Errors emitted by key-value stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O failure while reading or writing the backing file.
    #[error("i/o error: {source}")]
    Io {
        /// Source [`std::io::Error`].
        #[from]
        source: std::io::Error,
    },
    /// Serialization or deserialization error.
    #[error("serialization error: {source}")]
    Serialization {
        /// Source [`serde_json::Error`].
        #[from]
        source: SerdeError,
    },
    /// Backing file does not contain a JSON object.
    #[error("corrupt store at {path}: {reason}")]
    Corrupt {
        /// Path of the offending file.
        path: String,
        /// Human-readable reason describing the corruption.
        reason: String,
    },
}

/// Result type alias for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;
