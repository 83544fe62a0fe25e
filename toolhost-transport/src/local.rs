//! In-process peers served over a [`ChannelTransport`].

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::channel::{CHANNEL_CAPACITY, ChannelTransport};
use crate::message::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};

/// Request handler living inside the host process.
#[async_trait]
pub trait LocalPeer: Send + Sync + 'static {
    /// Answers one request.
    async fn serve(&self, method: &str, params: Option<Value>) -> Result<Value, JsonRpcError>;
}

/// Starts `peer` behind a fresh [`ChannelTransport`].
///
/// Each request is served on its own task, so a slow call never blocks the
/// ones behind it.
#[must_use]
pub fn spawn_local(label: impl Into<String>, peer: Arc<dyn LocalPeer>) -> Arc<ChannelTransport> {
    let label = label.into();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
    let transport = ChannelTransport::spawn(label.clone(), out_tx, in_rx, None);

    let worker = tokio::spawn(async move {
        while let Some(line) = out_rx.recv().await {
            let request: JsonRpcRequest = match serde_json::from_str(&line) {
                Ok(request) => request,
                Err(err) => {
                    warn!(peer = %label, error = %err, "local peer received malformed request");
                    continue;
                }
            };
            let peer = Arc::clone(&peer);
            let in_tx = in_tx.clone();
            tokio::spawn(async move {
                let id = Value::from(request.id);
                let response = match peer.serve(&request.method, request.params).await {
                    Ok(result) => JsonRpcResponse::success(id, result),
                    Err(error) => JsonRpcResponse::failure(id, error),
                };
                if let Ok(line) = serde_json::to_string(&response) {
                    let _ = in_tx.send(line).await;
                }
            });
        }
    });
    transport.attach_task(worker);
    transport
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Transport, TransportError};
    use serde_json::json;
    use std::time::Duration;

    struct Adder;

    #[async_trait]
    impl LocalPeer for Adder {
        async fn serve(&self, method: &str, params: Option<Value>) -> Result<Value, JsonRpcError> {
            match method {
                "add" => {
                    let params = params.unwrap_or_default();
                    let a = params["a"].as_i64().unwrap_or_default();
                    let b = params["b"].as_i64().unwrap_or_default();
                    Ok(json!(a + b))
                }
                other => Err(JsonRpcError::method_not_found(other)),
            }
        }
    }

    #[tokio::test]
    async fn serves_requests_and_errors() {
        let transport = spawn_local("adder", Arc::new(Adder));
        let response = transport
            .send(
                JsonRpcRequest::new("add", Some(json!({"a": 2, "b": 3}))),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(response.result, Some(json!(5)));

        let response = transport
            .send(JsonRpcRequest::new("sub", None), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(response.error.is_some());

        transport.close().await;
        let err = transport
            .send(JsonRpcRequest::new("add", None), Duration::from_secs(1))
            .await
            .expect_err("closed");
        assert!(matches!(err, TransportError::Closed));
    }
}
