//! Uniform request/response channel between the host and tool servers.
//!
//! Every runtime, whether a wasm module, a script process, or a remote peer,
//! ends up behind the [`Transport`] trait. Each request gets its own
//! correlation id and caller-supplied timeout; a timeout fails only that call,
//! while a channel disconnect fails every pending call once and closes the
//! transport.

#![warn(missing_docs, clippy::pedantic)]

mod channel;
mod local;
mod message;
mod pending;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;

pub use channel::{CHANNEL_CAPACITY, ChannelTransport};
pub use local::{LocalPeer, spawn_local};
pub use message::{
    FORBIDDEN, INTERNAL_ERROR, INVALID_PARAMS, Incoming, JSONRPC_VERSION, JsonRpcError,
    JsonRpcRequest, JsonRpcResponse, METHOD_CAPTURE_VISIBLE_TAB, METHOD_NOT_FOUND,
    METHOD_TOOLS_CALL, METHOD_TOOLS_LIST,
};
pub use pending::PendingCalls;

/// Errors surfaced by transports.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer did not answer within the caller's deadline.
    #[error("`{method}` timed out after {after:?}")]
    Timeout {
        /// Method that timed out.
        method: String,
        /// Deadline that elapsed.
        after: Duration,
    },
    /// The channel dropped while the call was pending.
    #[error("transport disconnected: {0}")]
    Disconnected(String),
    /// The transport was closed by the host.
    #[error("transport closed")]
    Closed,
    /// The request could not be encoded.
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Result alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Request/response channel to one running tool server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `request` and waits up to `timeout` for its response. The
    /// transport assigns the correlation id.
    async fn send(
        &self,
        request: JsonRpcRequest,
        timeout: Duration,
    ) -> TransportResult<JsonRpcResponse>;

    /// Releases the underlying resources. Idempotent.
    async fn close(&self);

    /// Returns `true` once the transport can no longer carry requests.
    fn is_closed(&self) -> bool;

    /// Returns a receiver that flips to `true` when the transport closes.
    fn closed_signal(&self) -> watch::Receiver<bool>;
}

/// Answers requests a sandbox sends back to the host over its channel.
#[async_trait]
pub trait HostRequestHandler: Send + Sync {
    /// Handles one host request.
    ///
    /// `in_flight` holds the `_meta.context` the host attached to each
    /// `tools/call` still pending on this channel, oldest first. It is
    /// recorded on the host side, unlike `params`, which the peer controls.
    async fn handle(
        &self,
        method: &str,
        params: Option<Value>,
        in_flight: &[Value],
    ) -> Result<Value, JsonRpcError>;
}
