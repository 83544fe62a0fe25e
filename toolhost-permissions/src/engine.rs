//! Permission engine evaluating per-origin grants and tool allowlists.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use thiserror::Error;
use tokio::sync::Mutex;
use toolhost_primitives::{Origin, Scope};
use toolhost_store::{KeyValueStore, StoreError};
use tracing::{debug, info};

use crate::grant::{
    Grant, GrantKind, GrantOptions, OriginPermissionRecord, PermissionStatus, TabId,
    TemporaryGrant, merge_records,
};
use crate::stores::{
    Clock, InMemoryTemporaryGrants, KvGrantStore, PersistentGrantStore, SystemClock,
    TemporaryGrantStore,
};

/// Default lifetime of a once-grant.
pub const DEFAULT_ONCE_TTL: Duration = Duration::from_secs(10 * 60);

/// Errors surfaced by the permission engine.
#[derive(Debug, Error)]
pub enum PermissionError {
    /// The origin lacks a scope; the caller should re-request consent for it.
    #[error("origin `{origin}` lacks permission `{scope}`")]
    PermissionDenied {
        /// Origin that made the request.
        origin: Origin,
        /// First missing scope.
        scope: Scope,
    },
    /// Tool execution is granted but the tool is outside the allowlist.
    #[error("tool `{tool}` is not in the allowlist for `{origin}`")]
    ToolNotAllowed {
        /// Origin that made the request.
        origin: Origin,
        /// Tool that was refused.
        tool: String,
    },
    /// Request failed validation before evaluation.
    #[error("invalid permission request: {0}")]
    InvalidRequest(&'static str),
    /// Persistent store failure.
    #[error("permission store failure: {0}")]
    Store(#[from] StoreError),
    /// Stored record could not be decoded.
    #[error("corrupt permission record: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result alias for permission operations.
pub type PermissionResult<T> = Result<T, PermissionError>;

/// Evaluates and mutates per-origin capability grants.
///
/// Persistent decisions (`always`, `deny`) live in a [`PersistentGrantStore`];
/// once-grants live in a [`TemporaryGrantStore`] with an absolute deadline.
/// Reads merge both through [`merge_records`] so temporary grants take
/// precedence while they are live.
pub struct PermissionEngine {
    persistent: Arc<dyn PersistentGrantStore>,
    temporary: Arc<dyn TemporaryGrantStore>,
    clock: Arc<dyn Clock>,
    once_ttl: TimeDelta,
    writes: Mutex<()>,
}

impl fmt::Debug for PermissionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionEngine")
            .field("once_ttl", &self.once_ttl)
            .finish_non_exhaustive()
    }
}

impl PermissionEngine {
    /// Starts building an engine over the given persistent store.
    #[must_use]
    pub fn builder(persistent: Arc<dyn PersistentGrantStore>) -> PermissionEngineBuilder {
        PermissionEngineBuilder {
            persistent,
            temporary: None,
            clock: None,
            once_ttl: DEFAULT_ONCE_TTL,
        }
    }

    /// Creates an engine persisting into a key-value store with default
    /// settings.
    #[must_use]
    pub fn with_store(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            persistent: Arc::new(KvGrantStore::new(store)),
            temporary: Arc::new(InMemoryTemporaryGrants::new()),
            clock: Arc::new(SystemClock),
            once_ttl: TimeDelta::minutes(10),
            writes: Mutex::new(()),
        }
    }

    /// Returns the configured once-grant lifetime.
    #[must_use]
    pub fn once_ttl(&self) -> TimeDelta {
        self.once_ttl
    }

    async fn effective(&self, origin: &Origin) -> PermissionResult<OriginPermissionRecord> {
        let persistent = self.persistent.load(origin).await?;
        let temporary = self.temporary.get(origin);
        Ok(merge_records(
            origin,
            persistent.as_ref(),
            temporary.as_ref(),
            self.clock.now(),
        ))
    }

    /// Returns `true` when `scope` is effectively granted for `origin`.
    ///
    /// # Errors
    ///
    /// Returns an error when the persistent store cannot be read.
    pub async fn has_permission(&self, origin: &Origin, scope: Scope) -> PermissionResult<bool> {
        let record = self.effective(origin).await?;
        Ok(record.allows(scope, self.clock.now()))
    }

    /// Returns `true` when `origin` may execute `tool`.
    ///
    /// # Errors
    ///
    /// Returns an error when the persistent store cannot be read.
    pub async fn is_tool_allowed(&self, origin: &Origin, tool: &str) -> PermissionResult<bool> {
        let record = self.effective(origin).await?;
        Ok(record.allows_tool(tool, self.clock.now()))
    }

    /// Fails with the first scope in `scopes` that is not effectively granted.
    ///
    /// # Errors
    ///
    /// Returns [`PermissionError::PermissionDenied`] naming the missing scope,
    /// or a store error.
    pub async fn check_permissions(&self, origin: &Origin, scopes: &[Scope]) -> PermissionResult<()> {
        let record = self.effective(origin).await?;
        let now = self.clock.now();
        match scopes.iter().find(|scope| !record.allows(**scope, now)) {
            Some(scope) => Err(PermissionError::PermissionDenied {
                origin: origin.clone(),
                scope: *scope,
            }),
            None => Ok(()),
        }
    }

    /// Fails unless `origin` may execute `tool`.
    ///
    /// # Errors
    ///
    /// Returns [`PermissionError::PermissionDenied`] when tool execution is not
    /// granted at all, or [`PermissionError::ToolNotAllowed`] on an allowlist
    /// miss.
    pub async fn ensure_tool_allowed(&self, origin: &Origin, tool: &str) -> PermissionResult<()> {
        let record = self.effective(origin).await?;
        let now = self.clock.now();
        if !record.allows(Scope::ToolsCall, now) {
            return Err(PermissionError::PermissionDenied {
                origin: origin.clone(),
                scope: Scope::ToolsCall,
            });
        }
        if !record.allows_tool(tool, now) {
            return Err(PermissionError::ToolNotAllowed {
                origin: origin.clone(),
                tool: tool.to_owned(),
            });
        }
        Ok(())
    }

    /// Records consent for `scopes`.
    ///
    /// `always` grants persist and extend the allowlist; `once` grants live in
    /// memory for the configured TTL and replace the previous once-grant's
    /// allowlist.
    ///
    /// # Errors
    ///
    /// Returns [`PermissionError::InvalidRequest`] when `scopes` is empty, or a
    /// store error.
    pub async fn grant_permissions(
        &self,
        origin: &Origin,
        scopes: &[Scope],
        kind: GrantKind,
        options: GrantOptions,
    ) -> PermissionResult<()> {
        if scopes.is_empty() {
            return Err(PermissionError::InvalidRequest("no scopes requested"));
        }

        let _guard = self.writes.lock().await;
        let now = self.clock.now();

        match kind {
            GrantKind::Always => {
                let mut record = self
                    .persistent
                    .load(origin)
                    .await?
                    .unwrap_or_else(|| OriginPermissionRecord::new(origin.clone()));
                for scope in scopes {
                    record.set_grant(*scope, Grant::always(now));
                }
                if let Some(tools) = options.allowed_tools {
                    record.union_allowed_tools(tools);
                }
                self.persistent.save(record).await?;
            }
            GrantKind::Once => {
                let mut granted: BTreeSet<Scope> = scopes.iter().copied().collect();
                let mut tab_id = options.tab_id;
                if let Some(previous) = self.temporary.get(origin).filter(|g| g.is_live(now)) {
                    granted.extend(previous.scopes);
                    tab_id = tab_id.or(previous.tab_id);
                }
                self.temporary.put(TemporaryGrant {
                    origin: origin.clone(),
                    scopes: granted,
                    allowed_tools: options
                        .allowed_tools
                        .map(|tools| tools.into_iter().collect()),
                    granted_at: now,
                    expires_at: now + self.once_ttl,
                    tab_id,
                });
            }
        }

        info!(origin = %origin, scopes = ?scopes, kind = ?kind, "permissions granted");
        Ok(())
    }

    /// Persistently denies `scopes` and removes them from the origin's
    /// temporary bundle.
    ///
    /// # Errors
    ///
    /// Returns [`PermissionError::InvalidRequest`] when `scopes` is empty, or a
    /// store error.
    pub async fn deny_permissions(&self, origin: &Origin, scopes: &[Scope]) -> PermissionResult<()> {
        if scopes.is_empty() {
            return Err(PermissionError::InvalidRequest("no scopes requested"));
        }

        let _guard = self.writes.lock().await;
        let now = self.clock.now();

        let mut record = self
            .persistent
            .load(origin)
            .await?
            .unwrap_or_else(|| OriginPermissionRecord::new(origin.clone()));
        for scope in scopes {
            record.set_grant(*scope, Grant::denied(now));
        }
        self.persistent.save(record).await?;

        if let Some(mut temp) = self.temporary.remove(origin) {
            temp.scopes.retain(|scope| !scopes.contains(scope));
            if !temp.scopes.is_empty() {
                self.temporary.put(temp);
            }
        }

        info!(origin = %origin, scopes = ?scopes, "permissions denied");
        Ok(())
    }

    /// Clears every persistent and temporary decision for `origin`.
    ///
    /// # Errors
    ///
    /// Returns a store error when the persistent record cannot be deleted.
    pub async fn revoke_permissions(&self, origin: &Origin) -> PermissionResult<()> {
        let _guard = self.writes.lock().await;
        self.persistent.delete(origin).await?;
        self.temporary.remove(origin);
        info!(origin = %origin, "permissions revoked");
        Ok(())
    }

    /// Drops the temporary bundle of `origin`, leaving persistent grants.
    pub fn clear_origin_grants(&self, origin: &Origin) -> bool {
        let removed = self.temporary.remove(origin).is_some();
        debug!(origin = %origin, removed, "cleared temporary grants for origin");
        removed
    }

    /// Drops every temporary bundle tagged with `tab_id`, returning how many.
    pub fn clear_tab_grants(&self, tab_id: TabId) -> usize {
        let removed = self.temporary.remove_tab(tab_id);
        debug!(tab_id, removed, "cleared temporary grants for tab");
        removed
    }

    /// Returns the effective permissions of one origin.
    ///
    /// # Errors
    ///
    /// Returns an error when the persistent store cannot be read.
    pub async fn get_permissions(&self, origin: &Origin) -> PermissionResult<PermissionStatus> {
        let record = self.effective(origin).await?;
        Ok(PermissionStatus::from_record(&record, self.clock.now()))
    }

    /// Returns the effective permissions of every known origin, ordered by
    /// origin.
    ///
    /// # Errors
    ///
    /// Returns an error when the persistent store cannot be read.
    pub async fn get_all_permissions(&self) -> PermissionResult<Vec<PermissionStatus>> {
        let now = self.clock.now();
        let mut persistent: BTreeMap<Origin, OriginPermissionRecord> = self
            .persistent
            .load_all()
            .await?
            .into_iter()
            .map(|record| (record.origin().clone(), record))
            .collect();
        let mut temporary: BTreeMap<Origin, TemporaryGrant> = self
            .temporary
            .all()
            .into_iter()
            .filter(|grant| grant.is_live(now))
            .map(|grant| (grant.origin.clone(), grant))
            .collect();

        let origins: BTreeSet<Origin> = persistent.keys().chain(temporary.keys()).cloned().collect();
        Ok(origins
            .into_iter()
            .map(|origin| {
                let merged = merge_records(
                    &origin,
                    persistent.remove(&origin).as_ref(),
                    temporary.remove(&origin).as_ref(),
                    now,
                );
                PermissionStatus::from_record(&merged, now)
            })
            .filter(|status| !status.scopes.is_empty() || status.allowed_tools.is_some())
            .collect())
    }
}

/// Builder for [`PermissionEngine`].
pub struct PermissionEngineBuilder {
    persistent: Arc<dyn PersistentGrantStore>,
    temporary: Option<Arc<dyn TemporaryGrantStore>>,
    clock: Option<Arc<dyn Clock>>,
    once_ttl: Duration,
}

impl PermissionEngineBuilder {
    /// Supplies the temporary grant store.
    #[must_use]
    pub fn temporary(mut self, temporary: Arc<dyn TemporaryGrantStore>) -> Self {
        self.temporary = Some(temporary);
        self
    }

    /// Supplies the clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Sets the once-grant lifetime.
    #[must_use]
    pub fn once_ttl(mut self, ttl: Duration) -> Self {
        self.once_ttl = ttl;
        self
    }

    /// Finalises the engine.
    ///
    /// # Errors
    ///
    /// Returns [`PermissionError::InvalidRequest`] when the TTL is zero or
    /// out of range.
    pub fn build(self) -> PermissionResult<PermissionEngine> {
        if self.once_ttl.is_zero() {
            return Err(PermissionError::InvalidRequest("once ttl must be non-zero"));
        }
        let once_ttl = TimeDelta::from_std(self.once_ttl)
            .map_err(|_| PermissionError::InvalidRequest("once ttl out of range"))?;

        Ok(PermissionEngine {
            persistent: self.persistent,
            temporary: self
                .temporary
                .unwrap_or_else(|| Arc::new(InMemoryTemporaryGrants::new())),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            once_ttl,
            writes: Mutex::new(()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grant::GrantStatus;
    use crate::stores::ManualClock;
    use chrono::{DateTime, Utc};
    use toolhost_store::MemoryStore;

    struct Fixture {
        engine: PermissionEngine,
        clock: Arc<ManualClock>,
    }

    fn start() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(start()));
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let engine = PermissionEngine::builder(Arc::new(KvGrantStore::new(kv)))
            .clock(clock.clone())
            .build()
            .unwrap();
        Fixture { engine, clock }
    }

    fn origin() -> Origin {
        Origin::parse("https://app.example.com").unwrap()
    }

    #[tokio::test]
    async fn deny_overrides_always() {
        let Fixture { engine, .. } = fixture();
        engine
            .grant_permissions(&origin(), &[Scope::ToolsCall], GrantKind::Always, GrantOptions::default())
            .await
            .unwrap();
        assert!(engine.has_permission(&origin(), Scope::ToolsCall).await.unwrap());

        engine.deny_permissions(&origin(), &[Scope::ToolsCall]).await.unwrap();
        assert!(!engine.has_permission(&origin(), Scope::ToolsCall).await.unwrap());
    }

    #[tokio::test]
    async fn deny_purges_matching_temporary_scopes() {
        let Fixture { engine, .. } = fixture();
        engine
            .grant_permissions(
                &origin(),
                &[Scope::ToolsCall, Scope::ModelPrompt],
                GrantKind::Once,
                GrantOptions::default(),
            )
            .await
            .unwrap();

        engine.deny_permissions(&origin(), &[Scope::ToolsCall]).await.unwrap();
        assert!(!engine.has_permission(&origin(), Scope::ToolsCall).await.unwrap());
        assert!(engine.has_permission(&origin(), Scope::ModelPrompt).await.unwrap());
    }

    #[tokio::test]
    async fn once_grant_boundary() {
        let Fixture { engine, clock } = fixture();
        engine
            .grant_permissions(&origin(), &[Scope::ModelPrompt], GrantKind::Once, GrantOptions::default())
            .await
            .unwrap();

        clock.set(start() + engine.once_ttl() - TimeDelta::milliseconds(1));
        assert!(engine.has_permission(&origin(), Scope::ModelPrompt).await.unwrap());

        clock.set(start() + engine.once_ttl());
        assert!(!engine.has_permission(&origin(), Scope::ModelPrompt).await.unwrap());
    }

    #[tokio::test]
    async fn always_grants_union_allowed_tools() {
        let Fixture { engine, .. } = fixture();
        for tool in ["files/read", "files/write"] {
            engine
                .grant_permissions(
                    &origin(),
                    &[Scope::ToolsCall],
                    GrantKind::Always,
                    GrantOptions::default().with_allowed_tools([tool]),
                )
                .await
                .unwrap();
        }

        assert!(engine.is_tool_allowed(&origin(), "files/read").await.unwrap());
        assert!(engine.is_tool_allowed(&origin(), "files/write").await.unwrap());
        assert!(!engine.is_tool_allowed(&origin(), "files/delete").await.unwrap());
    }

    #[tokio::test]
    async fn once_grants_replace_allowed_tools() {
        let Fixture { engine, .. } = fixture();
        for tool in ["files/read", "files/write"] {
            engine
                .grant_permissions(
                    &origin(),
                    &[Scope::ToolsCall],
                    GrantKind::Once,
                    GrantOptions::default().with_allowed_tools([tool]),
                )
                .await
                .unwrap();
        }

        assert!(!engine.is_tool_allowed(&origin(), "files/read").await.unwrap());
        assert!(engine.is_tool_allowed(&origin(), "files/write").await.unwrap());
    }

    #[tokio::test]
    async fn tool_check_requires_execution_scope() {
        let Fixture { engine, .. } = fixture();
        let err = engine
            .ensure_tool_allowed(&origin(), "files/read")
            .await
            .expect_err("no scope");
        assert!(matches!(
            err,
            PermissionError::PermissionDenied { scope: Scope::ToolsCall, .. }
        ));

        engine
            .grant_permissions(
                &origin(),
                &[Scope::ToolsCall],
                GrantKind::Always,
                GrantOptions::default().with_allowed_tools(["files/read"]),
            )
            .await
            .unwrap();
        let err = engine
            .ensure_tool_allowed(&origin(), "files/write")
            .await
            .expect_err("allowlist miss");
        assert!(matches!(err, PermissionError::ToolNotAllowed { tool, .. } if tool == "files/write"));
    }

    #[tokio::test]
    async fn check_permissions_reports_first_missing_scope() {
        let Fixture { engine, .. } = fixture();
        engine
            .grant_permissions(&origin(), &[Scope::ToolsList], GrantKind::Always, GrantOptions::default())
            .await
            .unwrap();

        engine.check_permissions(&origin(), &[Scope::ToolsList]).await.unwrap();
        let err = engine
            .check_permissions(&origin(), &[Scope::ToolsList, Scope::ToolsCall, Scope::ChatOpen])
            .await
            .expect_err("missing");
        assert!(matches!(
            err,
            PermissionError::PermissionDenied { scope: Scope::ToolsCall, .. }
        ));
    }

    #[tokio::test]
    async fn tab_cleanup_leaves_persistent_grants() {
        let Fixture { engine, .. } = fixture();
        engine
            .grant_permissions(&origin(), &[Scope::ModelPrompt], GrantKind::Always, GrantOptions::default())
            .await
            .unwrap();
        engine
            .grant_permissions(
                &origin(),
                &[Scope::ActiveTabRead],
                GrantKind::Once,
                GrantOptions::default().with_tab(42),
            )
            .await
            .unwrap();

        assert_eq!(engine.clear_tab_grants(42), 1);
        assert!(engine.has_permission(&origin(), Scope::ModelPrompt).await.unwrap());
        assert!(!engine.has_permission(&origin(), Scope::ActiveTabRead).await.unwrap());
    }

    #[tokio::test]
    async fn all_permissions_show_temporary_over_persistent() {
        let Fixture { engine, .. } = fixture();
        let other = Origin::parse("https://other.example").unwrap();
        engine.deny_permissions(&origin(), &[Scope::WebFetch]).await.unwrap();
        engine
            .grant_permissions(&origin(), &[Scope::WebFetch], GrantKind::Once, GrantOptions::default())
            .await
            .unwrap();
        engine
            .grant_permissions(&other, &[Scope::ChatOpen], GrantKind::Always, GrantOptions::default())
            .await
            .unwrap();

        let all = engine.get_all_permissions().await.unwrap();
        assert_eq!(all.len(), 2);
        let app = all.iter().find(|status| status.origin == origin()).unwrap();
        assert_eq!(app.scopes.get(&Scope::WebFetch), Some(&GrantStatus::GrantedOnce));
    }

    #[tokio::test]
    async fn revoke_clears_everything() {
        let Fixture { engine, .. } = fixture();
        engine
            .grant_permissions(&origin(), &[Scope::ChatOpen], GrantKind::Always, GrantOptions::default())
            .await
            .unwrap();
        engine
            .grant_permissions(&origin(), &[Scope::ModelList], GrantKind::Once, GrantOptions::default())
            .await
            .unwrap();

        engine.revoke_permissions(&origin()).await.unwrap();
        let status = engine.get_permissions(&origin()).await.unwrap();
        assert!(status.scopes.is_empty());
        assert!(engine.get_all_permissions().await.unwrap().is_empty());
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let result = PermissionEngine::builder(Arc::new(KvGrantStore::new(kv)))
            .once_ttl(Duration::ZERO)
            .build();
        assert!(matches!(result, Err(PermissionError::InvalidRequest(_))));
    }
}
