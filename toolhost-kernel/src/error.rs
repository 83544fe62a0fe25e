use std::time::Duration;

use thiserror::Error;
use toolhost_adapters::AdapterError;
use toolhost_permissions::PermissionError;
use toolhost_primitives::{Origin, Scope, ServerId};
use toolhost_runtimes::RuntimeError;
use toolhost_store::StoreError;

/// Errors surfaced by the kernel.
#[derive(Debug, Error)]
pub enum KernelError {
    /// Origin lacks a scope; carries the scope so consent can be re-requested.
    #[error("origin `{origin}` lacks permission `{scope}`")]
    PermissionDenied {
        /// Requesting origin.
        origin: Origin,
        /// Missing scope.
        scope: Scope,
    },
    /// Tool is outside the origin's allowlist.
    #[error("tool `{tool}` is not allowed for origin `{origin}`")]
    ToolNotAllowed {
        /// Requesting origin.
        origin: Origin,
        /// Tool key that was refused.
        tool: String,
    },
    /// No registered server exposes the tool.
    #[error("tool `{server_id}/{tool}` not found")]
    ToolNotFound {
        /// Server identifier.
        server_id: String,
        /// Tool name.
        tool: String,
    },
    /// Server is not registered.
    #[error("server `{0}` is not registered")]
    ServerNotFound(String),
    /// Server is registered but has no active session.
    #[error("server `{0}` is not started")]
    ServerNotStarted(ServerId),
    /// Server could not be started.
    #[error("server `{id}` failed to start: {reason}")]
    StartFailed {
        /// Server identifier.
        id: ServerId,
        /// Underlying failure.
        reason: String,
    },
    /// Metadata call did not answer in time.
    #[error("`{method}` timed out after {after:?}")]
    Timeout {
        /// Method that timed out.
        method: String,
        /// Configured deadline.
        after: Duration,
    },
    /// Launch-time failure from a runtime.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Permission engine failure other than a refusal.
    #[error(transparent)]
    Permission(PermissionError),
    /// Manifest or identifier rejected.
    #[error(transparent)]
    Manifest(#[from] toolhost_primitives::Error),
    /// Chat model failure.
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    /// JSON encoding or decoding failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Kernel configuration was invalid.
    #[error("invalid kernel configuration: {0}")]
    InvalidConfig(&'static str),
    /// Unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<PermissionError> for KernelError {
    fn from(err: PermissionError) -> Self {
        match err {
            PermissionError::PermissionDenied { origin, scope } => {
                Self::PermissionDenied { origin, scope }
            }
            PermissionError::ToolNotAllowed { origin, tool } => Self::ToolNotAllowed { origin, tool },
            other => Self::Permission(other),
        }
    }
}

/// Result alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;
