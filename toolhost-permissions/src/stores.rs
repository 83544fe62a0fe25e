//! Storage seams for persistent and temporary grants, plus the clock.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use toolhost_primitives::Origin;
use toolhost_store::KeyValueStore;

use crate::engine::PermissionResult;
use crate::grant::{OriginPermissionRecord, TabId, TemporaryGrant};

/// Key under which persistent records are stored.
pub const PERMISSIONS_KEY: &str = "permissions:v1";

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// [`Clock`] reading the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable [`Clock`] for deterministic expiry checks.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Creates a clock frozen at `now`.
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Moves the clock to `now`.
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    /// Moves the clock forward.
    pub fn advance(&self, delta: TimeDelta) {
        let mut guard = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *guard += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Durable storage for `always` grants and denials.
#[async_trait]
pub trait PersistentGrantStore: Send + Sync {
    /// Loads the record for an origin.
    async fn load(&self, origin: &Origin) -> PermissionResult<Option<OriginPermissionRecord>>;

    /// Loads every stored record.
    async fn load_all(&self) -> PermissionResult<Vec<OriginPermissionRecord>>;

    /// Replaces the record for its origin.
    async fn save(&self, record: OriginPermissionRecord) -> PermissionResult<()>;

    /// Deletes the record for an origin.
    async fn delete(&self, origin: &Origin) -> PermissionResult<()>;
}

/// [`PersistentGrantStore`] keeping every record in one key-value document.
pub struct KvGrantStore {
    store: Arc<dyn KeyValueStore>,
}

impl KvGrantStore {
    /// Wraps a key-value store.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    async fn read_map(&self) -> PermissionResult<BTreeMap<Origin, OriginPermissionRecord>> {
        match self.store.get(PERMISSIONS_KEY).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(BTreeMap::new()),
        }
    }

    async fn write_map(
        &self,
        map: &BTreeMap<Origin, OriginPermissionRecord>,
    ) -> PermissionResult<()> {
        let value: Value = serde_json::to_value(map)?;
        self.store.set(PERMISSIONS_KEY, value).await?;
        Ok(())
    }
}

impl fmt::Debug for KvGrantStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvGrantStore")
            .field("key", &PERMISSIONS_KEY)
            .finish()
    }
}

#[async_trait]
impl PersistentGrantStore for KvGrantStore {
    async fn load(&self, origin: &Origin) -> PermissionResult<Option<OriginPermissionRecord>> {
        Ok(self.read_map().await?.remove(origin))
    }

    async fn load_all(&self) -> PermissionResult<Vec<OriginPermissionRecord>> {
        Ok(self.read_map().await?.into_values().collect())
    }

    async fn save(&self, record: OriginPermissionRecord) -> PermissionResult<()> {
        let mut map = self.read_map().await?;
        map.insert(record.origin().clone(), record);
        self.write_map(&map).await
    }

    async fn delete(&self, origin: &Origin) -> PermissionResult<()> {
        let mut map = self.read_map().await?;
        if map.remove(origin).is_some() {
            self.write_map(&map).await?;
        }
        Ok(())
    }
}

/// Process-lifetime storage for once-grants.
pub trait TemporaryGrantStore: Send + Sync {
    /// Returns the bundle for an origin, live or not.
    fn get(&self, origin: &Origin) -> Option<TemporaryGrant>;

    /// Stores a bundle, replacing the origin's previous one.
    fn put(&self, grant: TemporaryGrant);

    /// Removes the bundle for an origin.
    fn remove(&self, origin: &Origin) -> Option<TemporaryGrant>;

    /// Removes every bundle tagged with `tab_id`, returning how many went.
    fn remove_tab(&self, tab_id: TabId) -> usize;

    /// Returns every stored bundle.
    fn all(&self) -> Vec<TemporaryGrant>;
}

/// [`TemporaryGrantStore`] backed by a mutex-guarded map.
#[derive(Debug, Default)]
pub struct InMemoryTemporaryGrants {
    grants: Mutex<HashMap<Origin, TemporaryGrant>>,
}

impl InMemoryTemporaryGrants {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Origin, TemporaryGrant>> {
        self.grants.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TemporaryGrantStore for InMemoryTemporaryGrants {
    fn get(&self, origin: &Origin) -> Option<TemporaryGrant> {
        self.lock().get(origin).cloned()
    }

    fn put(&self, grant: TemporaryGrant) {
        self.lock().insert(grant.origin.clone(), grant);
    }

    fn remove(&self, origin: &Origin) -> Option<TemporaryGrant> {
        self.lock().remove(origin)
    }

    fn remove_tab(&self, tab_id: TabId) -> usize {
        let mut guard = self.lock();
        let before = guard.len();
        guard.retain(|_, grant| grant.tab_id != Some(tab_id));
        before - guard.len()
    }

    fn all(&self) -> Vec<TemporaryGrant> {
        self.lock().values().cloned().collect()
    }
}
