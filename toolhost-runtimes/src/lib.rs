//! Runtime dispatch for tool servers.
//!
//! A manifest resolves to exactly one [`RuntimeKind`]; [`launch`] starts the
//! matching substrate and hands back the same [`Transport`] shape for all of
//! them:
//!
//! - `wasm`: a compiled module instantiated per request with fuel metering,
//! - `js`: a sandboxed native interpreter, else a builtin worker, else a stub,
//! - `remote`: an SSE or WebSocket channel.

#![warn(missing_docs, clippy::pedantic)]

pub mod builtin;
mod context;
mod remote;
mod script;
pub mod sse;
mod stub;
mod wasm;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use toolhost_primitives::{RuntimeKind, ServerManifest};
use toolhost_transport::Transport;
use tracing::info;

pub use context::{
    DEFAULT_FUEL_PER_CALL, OAUTH_TOKEN_ENV, OAuthToken, RuntimeContext, ScriptSettings,
    SecretProvider, StaticSecrets, TokenProvider,
};
pub use stub::StubPeer;

/// Errors raised while starting a runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Manifest lacks what the selected runtime needs.
    #[error("invalid manifest: {reason}")]
    InvalidManifest {
        /// Human-readable reason.
        reason: String,
    },
    /// Required OAuth token is absent or expired.
    #[error("authorization required for `{provider}`: {reason}")]
    AuthRequired {
        /// OAuth provider identifier.
        provider: String,
        /// Why no token could be used.
        reason: String,
    },
    /// Required secret has no value.
    #[error("required secret `{name}` is not configured")]
    MissingSecret {
        /// Secret name.
        name: String,
    },
    /// Remote peer could not be reached.
    #[error("failed to connect to `{url}`: {reason}")]
    Connect {
        /// Target URL.
        url: String,
        /// Underlying failure.
        reason: String,
    },
    /// Interpreter process could not be spawned.
    #[error("failed to spawn `{command}`: {reason}")]
    Spawn {
        /// Command that failed.
        command: String,
        /// Underlying failure.
        reason: String,
    },
    /// Wasm compilation or execution failure.
    #[error("wasm failure: {0}")]
    Wasm(String),
    /// Local I/O failure.
    #[error("i/o error: {source}")]
    Io {
        /// Source [`std::io::Error`].
        #[from]
        source: std::io::Error,
    },
}

impl RuntimeError {
    pub(crate) fn connect(url: &str, reason: impl fmt::Display) -> Self {
        Self::Connect {
            url: url.to_owned(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn wasm(err: impl fmt::Display) -> Self {
        Self::Wasm(format!("{err:#}"))
    }
}

/// Result alias for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Concrete substrate a runtime ended up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeFlavour {
    /// Fuel-metered wasm instance per request.
    Wasm,
    /// Sandboxed native interpreter process.
    NativeScript,
    /// In-process builtin worker.
    Builtin,
    /// Manifest-only stub.
    Stub,
    /// Remote peer over SSE.
    Sse,
    /// Remote peer over WebSocket.
    WebSocket,
}

impl RuntimeFlavour {
    /// Returns the runtime kind this flavour belongs to.
    #[must_use]
    pub const fn kind(self) -> RuntimeKind {
        match self {
            Self::Wasm => RuntimeKind::Wasm,
            Self::NativeScript | Self::Builtin | Self::Stub => RuntimeKind::Js,
            Self::Sse | Self::WebSocket => RuntimeKind::Remote,
        }
    }

    /// Returns a short label for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Wasm => "wasm",
            Self::NativeScript => "native-script",
            Self::Builtin => "builtin",
            Self::Stub => "stub",
            Self::Sse => "sse",
            Self::WebSocket => "websocket",
        }
    }
}

/// Transport produced by a successful launch.
pub struct Launched {
    /// Channel to the running server.
    pub transport: Arc<dyn Transport>,
    /// Substrate the server runs on.
    pub flavour: RuntimeFlavour,
}

impl Launched {
    /// Wraps a transport.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, flavour: RuntimeFlavour) -> Self {
        Self { transport, flavour }
    }
}

impl fmt::Debug for Launched {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Launched")
            .field("flavour", &self.flavour)
            .field("closed", &self.transport.is_closed())
            .finish()
    }
}

/// Starts the runtime selected by [`ServerManifest::resolved_runtime`].
///
/// # Errors
///
/// Returns a [`RuntimeError`] when the manifest is unusable for its runtime,
/// a required credential is missing, or the substrate cannot be reached.
pub async fn launch(manifest: &ServerManifest, ctx: &RuntimeContext) -> RuntimeResult<Launched> {
    let kind = manifest.resolved_runtime();
    let launched = match kind {
        RuntimeKind::Wasm => wasm::launch(manifest, ctx).await?,
        RuntimeKind::Js => script::launch(manifest, ctx).await?,
        RuntimeKind::Remote => remote::launch(manifest, ctx).await?,
    };
    info!(
        server_id = %manifest.id(),
        runtime = kind.as_str(),
        flavour = launched.flavour.as_str(),
        "runtime launched"
    );
    Ok(launched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use toolhost_primitives::{ServerId, ToolDefinition};

    #[tokio::test]
    async fn dispatch_follows_resolved_runtime() {
        let manifest = ServerManifest::builder(ServerId::new("notes").unwrap())
            .name("Notes")
            .version("1")
            .script_source("export {}")
            .tool(ToolDefinition::new("append"))
            .build()
            .unwrap();
        let launched = launch(&manifest, &RuntimeContext::default()).await.unwrap();
        assert_eq!(launched.flavour.kind(), RuntimeKind::Js);
        launched.transport.close().await;
        assert!(launched.transport.is_closed());
    }

    #[tokio::test]
    async fn default_runtime_is_wasm() {
        let manifest = ServerManifest::builder(ServerId::new("bare").unwrap())
            .name("Bare")
            .version("1")
            .build()
            .unwrap();
        let err = launch(&manifest, &RuntimeContext::default()).await.err().expect("no module");
        assert!(matches!(err, RuntimeError::InvalidManifest { .. }));
    }
}
