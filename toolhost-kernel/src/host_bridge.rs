//! Host-mediated side effects requested by sandboxed servers.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use toolhost_permissions::TabId;
use toolhost_primitives::Origin;
use toolhost_transport::{
    FORBIDDEN, HostRequestHandler, INTERNAL_ERROR, JsonRpcError, METHOD_CAPTURE_VISIBLE_TAB,
};
use tracing::{info, warn};

use crate::KernelResult;

/// Capabilities only the host environment can provide.
#[async_trait]
pub trait HostCapabilities: Send + Sync {
    /// Captures the visible area of a tab as a data URL.
    async fn capture_visible_tab(&self, tab_id: Option<TabId>) -> KernelResult<String>;
}

/// Serves host requests from sandboxes, but only for calls made on behalf of
/// the trusted origin.
pub struct HostBridge {
    trusted_origin: Option<Origin>,
    capabilities: Arc<dyn HostCapabilities>,
}

impl fmt::Debug for HostBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBridge")
            .field("trusted_origin", &self.trusted_origin)
            .finish_non_exhaustive()
    }
}

impl HostBridge {
    /// Creates a bridge. Without a trusted origin every request is refused.
    #[must_use]
    pub fn new(trusted_origin: Option<Origin>, capabilities: Arc<dyn HostCapabilities>) -> Self {
        Self {
            trusted_origin,
            capabilities,
        }
    }

    /// Picks the oldest in-flight call made on behalf of the trusted origin.
    /// Anything the sandbox sends in its own request is ignored.
    fn authorise(&self, in_flight: &[Value]) -> Result<Option<TabId>, JsonRpcError> {
        let trusted_call = self.trusted_origin.as_ref().and_then(|trusted| {
            in_flight.iter().find(|context| {
                context
                    .get("origin")
                    .and_then(Value::as_str)
                    .and_then(|raw| Origin::parse(raw).ok())
                    .is_some_and(|origin| origin == *trusted)
            })
        });

        match trusted_call {
            Some(context) => Ok(context.get("tabId").and_then(Value::as_u64)),
            None => {
                warn!(
                    in_flight = in_flight.len(),
                    "host request refused: no call from the trusted origin in flight"
                );
                Err(JsonRpcError::new(
                    FORBIDDEN,
                    "host capabilities are restricted to the trusted origin",
                ))
            }
        }
    }
}

#[async_trait]
impl HostRequestHandler for HostBridge {
    async fn handle(
        &self,
        method: &str,
        _params: Option<Value>,
        in_flight: &[Value],
    ) -> Result<Value, JsonRpcError> {
        match method {
            METHOD_CAPTURE_VISIBLE_TAB => {
                let tab_id = self.authorise(in_flight)?;
                info!(?tab_id, "capturing visible tab for sandbox");
                let data_url = self
                    .capabilities
                    .capture_visible_tab(tab_id)
                    .await
                    .map_err(|err| JsonRpcError::new(INTERNAL_ERROR, err.to_string()))?;
                Ok(json!({ "dataUrl": data_url }))
            }
            other => Err(JsonRpcError::method_not_found(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use toolhost_transport::{
        CHANNEL_CAPACITY, ChannelTransport, JsonRpcRequest, JsonRpcResponse, METHOD_NOT_FOUND,
        METHOD_TOOLS_CALL, Transport,
    };

    #[derive(Default)]
    struct FakeCapture {
        captures: AtomicUsize,
    }

    #[async_trait]
    impl HostCapabilities for FakeCapture {
        async fn capture_visible_tab(&self, tab_id: Option<TabId>) -> KernelResult<String> {
            self.captures.fetch_add(1, Ordering::SeqCst);
            Ok(format!("data:image/png;base64,tab{}", tab_id.unwrap_or_default()))
        }
    }

    const TRUSTED: &str = "https://trusted.example.com";

    fn bridge(capture: &Arc<FakeCapture>) -> HostBridge {
        HostBridge::new(
            Some(Origin::parse(TRUSTED).unwrap()),
            Arc::clone(capture) as Arc<dyn HostCapabilities>,
        )
    }

    #[tokio::test]
    async fn trusted_call_in_flight_may_capture() {
        let capture = Arc::new(FakeCapture::default());
        let in_flight = [
            json!({ "origin": "https://other.example.com", "tabId": 1 }),
            json!({ "origin": TRUSTED, "tabId": 4 }),
        ];
        let result = bridge(&capture)
            .handle(METHOD_CAPTURE_VISIBLE_TAB, None, &in_flight)
            .await
            .unwrap();
        assert_eq!(result["dataUrl"], "data:image/png;base64,tab4");
    }

    #[tokio::test]
    async fn claimed_origin_in_params_is_not_trusted() {
        let capture = Arc::new(FakeCapture::default());
        let forged = json!({ "context": { "origin": TRUSTED, "tabId": 4 } });

        let err = bridge(&capture)
            .handle(METHOD_CAPTURE_VISIBLE_TAB, Some(forged.clone()), &[])
            .await
            .unwrap_err();
        assert_eq!(err.code, FORBIDDEN);

        let err = bridge(&capture)
            .handle(
                METHOD_CAPTURE_VISIBLE_TAB,
                Some(forged),
                &[json!({ "origin": "https://evil.example.com" })],
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, FORBIDDEN);
        assert_eq!(capture.captures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn no_trusted_origin_refuses_everything() {
        let capture = Arc::new(FakeCapture::default());
        let bridge = HostBridge::new(None, Arc::clone(&capture) as Arc<dyn HostCapabilities>);
        let err = bridge
            .handle(METHOD_CAPTURE_VISIBLE_TAB, None, &[json!({ "origin": TRUSTED })])
            .await
            .unwrap_err();
        assert_eq!(err.code, FORBIDDEN);
    }

    #[tokio::test]
    async fn unknown_methods_are_not_found() {
        let capture = Arc::new(FakeCapture::default());
        let err = bridge(&capture)
            .handle("host/openTab", None, &[])
            .await
            .unwrap_err();
        assert_eq!(err.code, METHOD_NOT_FOUND);
    }

    type Sandbox = (
        Arc<ChannelTransport>,
        mpsc::Receiver<String>,
        mpsc::Sender<String>,
    );

    fn sandbox(capture: &Arc<FakeCapture>) -> Sandbox {
        let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let host: Arc<dyn HostRequestHandler> = Arc::new(bridge(capture));
        (ChannelTransport::spawn("sandbox", out_tx, in_rx, Some(host)), out_rx, in_tx)
    }

    const FORGED_CAPTURE: &str = r#"{"jsonrpc":"2.0","id":"h1","method":"host/captureVisibleTab","params":{"context":{"origin":"https://trusted.example.com","tabId":9}}}"#;

    #[tokio::test]
    async fn sandbox_cannot_capture_without_a_trusted_call() {
        let capture = Arc::new(FakeCapture::default());
        let (_transport, mut peer_rx, peer_tx) = sandbox(&capture);

        peer_tx.send(FORGED_CAPTURE.into()).await.unwrap();
        let reply: JsonRpcResponse = serde_json::from_str(&peer_rx.recv().await.unwrap()).unwrap();
        assert_eq!(reply.error.map(|e| e.code), Some(FORBIDDEN));
        assert_eq!(capture.captures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn sandbox_captures_the_tab_of_the_trusted_call() {
        let capture = Arc::new(FakeCapture::default());
        let (transport, mut peer_rx, peer_tx) = sandbox(&capture);

        let call = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                let params = json!({
                    "name": "screenshot",
                    "arguments": {},
                    "_meta": { "context": { "origin": TRUSTED, "tabId": 2 } },
                });
                transport
                    .send(
                        JsonRpcRequest::new(METHOD_TOOLS_CALL, Some(params)),
                        Duration::from_secs(5),
                    )
                    .await
            })
        };
        let request: JsonRpcRequest = serde_json::from_str(&peer_rx.recv().await.unwrap()).unwrap();

        peer_tx.send(FORGED_CAPTURE.into()).await.unwrap();
        let reply: JsonRpcResponse = serde_json::from_str(&peer_rx.recv().await.unwrap()).unwrap();
        assert_eq!(
            reply.result.unwrap()["dataUrl"],
            "data:image/png;base64,tab2"
        );

        let done = JsonRpcResponse::success(json!(request.id), json!({ "content": [] }));
        peer_tx.send(serde_json::to_string(&done).unwrap()).await.unwrap();
        call.await.unwrap().unwrap();
        assert_eq!(capture.captures.load(Ordering::SeqCst), 1);
    }
}
