//! Storage trait shared by the permission engine and the server registry.

use async_trait::async_trait;
use serde_json::Value;

use crate::StoreResult;

/// Asynchronous key-value store holding JSON documents.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetches the value stored under `key`.
    async fn get(&self, key: &str) -> StoreResult<Option<Value>>;

    /// Stores `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: Value) -> StoreResult<()>;

    /// Removes the value stored under `key`. Missing keys are not an error.
    async fn remove(&self, key: &str) -> StoreResult<()>;
}
