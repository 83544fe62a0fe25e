//! Correlation table for in-flight requests.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tokio::sync::oneshot;
use tracing::warn;

use crate::message::JsonRpcResponse;
use crate::{TransportError, TransportResult};

type Waiter = oneshot::Sender<TransportResult<JsonRpcResponse>>;

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    waiters: HashMap<u64, Waiter>,
    closed: Option<String>,
}

/// Maps correlation ids to the tasks awaiting their responses.
#[derive(Debug, Default)]
pub struct PendingCalls {
    inner: Mutex<Inner>,
}

impl PendingCalls {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates an id and registers a waiter for it.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Disconnected`] once the table has been failed.
    pub fn register(&self) -> TransportResult<(u64, oneshot::Receiver<TransportResult<JsonRpcResponse>>)> {
        let mut inner = self.lock();
        if let Some(reason) = &inner.closed {
            return Err(TransportError::Disconnected(reason.clone()));
        }
        inner.next_id += 1;
        let id = inner.next_id;
        let (tx, rx) = oneshot::channel();
        inner.waiters.insert(id, tx);
        Ok((id, rx))
    }

    /// Delivers a response to its waiter. Returns `false` for unknown ids.
    pub fn resolve(&self, response: JsonRpcResponse) -> bool {
        let Some(id) = response.numeric_id() else {
            warn!(id = %response.id, "response carries a non-numeric id");
            return false;
        };
        let waiter = self.lock().waiters.remove(&id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(Ok(response));
                true
            }
            None => {
                warn!(id, "received response for unknown request id");
                false
            }
        }
    }

    /// Forgets a waiter whose caller gave up.
    pub fn cancel(&self, id: u64) {
        self.lock().waiters.remove(&id);
    }

    /// Fails every waiter with one terminal error and refuses new ones.
    /// Returns the number of calls failed.
    pub fn fail_all(&self, reason: &str) -> usize {
        let waiters: Vec<Waiter> = {
            let mut inner = self.lock();
            if inner.closed.is_none() {
                inner.closed = Some(reason.to_owned());
            }
            inner.waiters.drain().map(|(_, tx)| tx).collect()
        };
        let count = waiters.len();
        for tx in waiters {
            let _ = tx.send(Err(TransportError::Disconnected(reason.to_owned())));
        }
        count
    }

    /// Returns the number of in-flight calls.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Returns `true` when nothing is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn resolves_by_id_out_of_order() {
        let pending = PendingCalls::new();
        let (first, rx1) = pending.register().unwrap();
        let (second, rx2) = pending.register().unwrap();
        assert_ne!(first, second);

        assert!(pending.resolve(JsonRpcResponse::success(json!(second), json!("b"))));
        assert!(pending.resolve(JsonRpcResponse::success(json!(first), json!("a"))));
        assert!(!pending.resolve(JsonRpcResponse::success(json!(99), json!("x"))));

        assert_eq!(rx1.await.unwrap().unwrap().result, Some(json!("a")));
        assert_eq!(rx2.await.unwrap().unwrap().result, Some(json!("b")));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn fail_all_is_terminal() {
        let pending = PendingCalls::new();
        let (_, rx) = pending.register().unwrap();

        assert_eq!(pending.fail_all("peer went away"), 1);
        let err = rx.await.unwrap().expect_err("disconnected");
        assert!(matches!(err, TransportError::Disconnected(reason) if reason == "peer went away"));
        assert!(pending.register().is_err());
    }
}
