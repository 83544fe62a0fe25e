//! Line-oriented transport over a pair of message channels.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::message::{Incoming, JsonRpcError, JsonRpcRequest, JsonRpcResponse, METHOD_TOOLS_CALL};
use crate::pending::PendingCalls;
use crate::{HostRequestHandler, Transport, TransportError, TransportResult};

/// Capacity of the channels created by runtimes for their pumps.
pub const CHANNEL_CAPACITY: usize = 64;

/// [`Transport`] speaking newline-free JSON messages over `mpsc` channels.
///
/// Runtimes bridge their substrate (child process, WebSocket, SSE stream,
/// wasm instance, in-process worker) onto the two channels and register the
/// bridging tasks with [`ChannelTransport::attach_task`] so that
/// [`Transport::close`] tears them down.
pub struct ChannelTransport {
    label: String,
    outbound: mpsc::Sender<String>,
    pending: Arc<PendingCalls>,
    callers: Arc<CallerContexts>,
    closed: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// `_meta.context` of every `tools/call` still awaiting its response, keyed
/// by correlation id. Recorded host-side so a peer cannot forge it.
#[derive(Debug, Default)]
struct CallerContexts(Mutex<HashMap<u64, Value>>);

impl CallerContexts {
    fn insert(&self, id: u64, context: Value) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, context);
    }

    fn remove(&self, id: u64) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    fn snapshot(&self) -> Vec<Value> {
        let mut entries: Vec<(u64, Value)> = self
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, context)| (*id, context.clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries.into_iter().map(|(_, context)| context).collect()
    }
}

/// Releases the bookkeeping of one call however its `send` future ends,
/// including when the caller drops it.
struct InFlight<'a> {
    id: u64,
    pending: &'a PendingCalls,
    callers: &'a CallerContexts,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.pending.cancel(self.id);
        self.callers.remove(self.id);
    }
}

fn caller_context(request: &JsonRpcRequest) -> Option<Value> {
    if request.method != METHOD_TOOLS_CALL {
        return None;
    }
    request
        .params
        .as_ref()?
        .get("_meta")?
        .get("context")
        .cloned()
}

impl ChannelTransport {
    /// Wires a transport onto `outbound`/`inbound` and starts its reader.
    ///
    /// Requests initiated by the peer are answered by `host`; without a
    /// handler they get a method-not-found error.
    #[must_use]
    pub fn spawn(
        label: impl Into<String>,
        outbound: mpsc::Sender<String>,
        inbound: mpsc::Receiver<String>,
        host: Option<Arc<dyn HostRequestHandler>>,
    ) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        let transport = Arc::new(Self {
            label: label.into(),
            outbound: outbound.clone(),
            pending: Arc::new(PendingCalls::new()),
            callers: Arc::new(CallerContexts::default()),
            closed,
            tasks: Mutex::new(Vec::new()),
        });

        let reader = tokio::spawn(read_loop(
            Arc::downgrade(&transport),
            Arc::clone(&transport.pending),
            Arc::clone(&transport.callers),
            transport.label.clone(),
            inbound,
            outbound,
            host,
        ));
        transport.attach_task(reader);
        transport
    }

    /// Registers a task that is aborted when the transport closes.
    pub fn attach_task(&self, handle: JoinHandle<()>) {
        if *self.closed.borrow() {
            handle.abort();
            return;
        }
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    /// Returns the label used in logs.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    fn mark_closed(&self, reason: &str) {
        let failed = self.pending.fail_all(reason);
        if !self.closed.send_replace(true) {
            debug!(transport = %self.label, reason, failed, "transport closed");
        }
    }
}

async fn read_loop(
    transport: std::sync::Weak<ChannelTransport>,
    pending: Arc<PendingCalls>,
    callers: Arc<CallerContexts>,
    label: String,
    mut inbound: mpsc::Receiver<String>,
    outbound: mpsc::Sender<String>,
    host: Option<Arc<dyn HostRequestHandler>>,
) {
    while let Some(line) = inbound.recv().await {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        trace!(transport = %label, raw = %trimmed, "peer -> host");

        match Incoming::parse(trimmed) {
            Ok(Incoming::Response(response)) => {
                pending.resolve(response);
            }
            Ok(Incoming::Request { id, method, params }) => {
                let in_flight = callers.snapshot();
                let host = host.clone();
                let outbound = outbound.clone();
                let label = label.clone();
                tokio::spawn(async move {
                    let response = match host {
                        Some(host) => match host.handle(&method, params, &in_flight).await {
                            Ok(result) => JsonRpcResponse::success(id, result),
                            Err(error) => JsonRpcResponse::failure(id, error),
                        },
                        None => JsonRpcResponse::failure(id, JsonRpcError::method_not_found(&method)),
                    };
                    match serde_json::to_string(&response) {
                        Ok(line) => {
                            if outbound.send(line).await.is_err() {
                                debug!(transport = %label, method, "peer gone before host reply");
                            }
                        }
                        Err(err) => warn!(transport = %label, error = %err, "failed to encode host reply"),
                    }
                });
            }
            Ok(Incoming::Notification { method }) => {
                trace!(transport = %label, method, "ignoring peer notification");
            }
            Err(err) => {
                warn!(transport = %label, error = %err, "discarding malformed message from peer");
            }
        }
    }

    if let Some(transport) = transport.upgrade() {
        transport.mark_closed("channel disconnected");
    } else {
        pending.fail_all("channel disconnected");
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(
        &self,
        mut request: JsonRpcRequest,
        timeout: Duration,
    ) -> TransportResult<JsonRpcResponse> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let (id, rx) = self.pending.register()?;
        let _in_flight = InFlight {
            id,
            pending: &self.pending,
            callers: &self.callers,
        };
        request.id = id;
        if let Some(context) = caller_context(&request) {
            self.callers.insert(id, context);
        }
        let line = serde_json::to_string(&request)?;

        trace!(transport = %self.label, method = %request.method, id, "host -> peer");
        if self.outbound.send(line).await.is_err() {
            return Err(TransportError::Disconnected("outbound channel closed".into()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Disconnected("reader stopped".into())),
            Err(_) => Err(TransportError::Timeout {
                method: request.method,
                after: timeout,
            }),
        }
    }

    async fn close(&self) {
        self.mark_closed("transport closed");
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

impl Drop for ChannelTransport {
    fn drop(&mut self) {
        for task in self
            .tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }
}
