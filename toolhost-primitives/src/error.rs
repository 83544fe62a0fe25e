//! Shared error definitions for toolhost primitives.

use thiserror::Error;

/// Result alias used throughout the toolhost crates.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while validating primitive types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Server identifier failed validation.
    #[error("invalid server id `{id}`: {reason}")]
    InvalidServerId {
        /// The offending identifier string.
        id: String,
        /// Human-readable reason for rejection.
        reason: String,
    },

    /// Origin string could not be interpreted as `scheme://host[:port]`.
    #[error("invalid origin `{origin}`: {reason}")]
    InvalidOrigin {
        /// The offending origin string.
        origin: String,
        /// Human-readable reason for rejection.
        reason: String,
    },

    /// Scope string is not one of the known capability scopes.
    #[error("unknown permission scope `{0}`")]
    UnknownScope(String),

    /// Tool key could not be split into server and tool parts.
    #[error("invalid tool key `{0}`: expected `serverId/toolName`")]
    InvalidToolKey(String),

    /// Manifest definition failed validation.
    #[error("invalid manifest: {reason}")]
    InvalidManifest {
        /// Human-readable reason for rejection.
        reason: String,
    },
}

impl Error {
    /// Convenience constructor for manifest validation failures.
    #[must_use]
    pub fn manifest(reason: impl Into<String>) -> Self {
        Self::InvalidManifest {
            reason: reason.into(),
        }
    }
}
