//! Process-scoped server registry: manifests, tool index, and live sessions.
//!
//! The registry is rebuilt from empty at startup (see
//! [`ServerRegistry::load_persisted`]); only manifests are persisted, never
//! sessions.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use toolhost_primitives::{RuntimeKind, ServerId, ServerManifest, ToolDefinition, ToolKey};
use toolhost_runtimes::{Launched, RuntimeContext, RuntimeFlavour, RuntimeResult};
use toolhost_store::KeyValueStore;
use toolhost_transport::{JsonRpcRequest, METHOD_TOOLS_LIST, Transport, TransportError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{KernelError, KernelResult};

/// Store key holding the installed manifests.
pub const SERVERS_KEY: &str = "servers:v1";

/// Deadlines applied to calls the registry and gateway make.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Metadata calls such as the `tools/list` probe.
    pub metadata: Duration,
    /// Interactive tool calls.
    pub tool_call: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            metadata: Duration::from_secs(5),
            tool_call: Duration::from_secs(60),
        }
    }
}

/// Starts a runtime for a manifest.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Launches the manifest's runtime.
    async fn launch(
        &self,
        manifest: &ServerManifest,
        ctx: &RuntimeContext,
    ) -> RuntimeResult<Launched>;
}

/// [`Launcher`] dispatching to the built-in wasm, script, and remote runtimes.
#[derive(Debug, Default, Clone, Copy)]
pub struct RuntimeLauncher;

#[async_trait]
impl Launcher for RuntimeLauncher {
    async fn launch(
        &self,
        manifest: &ServerManifest,
        ctx: &RuntimeContext,
    ) -> RuntimeResult<Launched> {
        toolhost_runtimes::launch(manifest, ctx).await
    }
}

/// Notified when a server's validated tool list changes, e.g. to mirror it to
/// a compatibility peer.
#[async_trait]
pub trait ToolListObserver: Send + Sync {
    /// Receives the refreshed manifest. Failures are logged and ignored.
    async fn tools_changed(&self, manifest: &ServerManifest) -> KernelResult<()>;
}

/// A started server.
#[derive(Clone)]
pub struct Session {
    id: Uuid,
    transport: Arc<dyn Transport>,
    flavour: RuntimeFlavour,
    started_at: DateTime<Utc>,
}

impl Session {
    fn new(launched: Launched) -> Self {
        Self {
            id: Uuid::new_v4(),
            transport: launched.transport,
            flavour: launched.flavour,
            started_at: Utc::now(),
        }
    }

    /// Returns the session identifier.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the channel to the server.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Returns the substrate the server runs on.
    #[must_use]
    pub fn flavour(&self) -> RuntimeFlavour {
        self.flavour
    }

    /// Returns the runtime kind of the session.
    #[must_use]
    pub fn runtime(&self) -> RuntimeKind {
        self.flavour.kind()
    }

    /// Returns when the session started.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("flavour", &self.flavour)
            .field("started_at", &self.started_at)
            .field("closed", &self.transport.is_closed())
            .finish()
    }
}

/// Tool index value for `serverId:toolName`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ToolIndexEntry {
    /// Owning server.
    pub server_id: ServerId,
    /// Tool name.
    pub name: String,
}

/// Handle to a registered manifest.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    manifest: Arc<ServerManifest>,
}

impl ServerHandle {
    /// Returns the server identifier.
    #[must_use]
    pub fn id(&self) -> &ServerId {
        self.manifest.id()
    }

    /// Returns the registered manifest.
    #[must_use]
    pub fn manifest(&self) -> &ServerManifest {
        &self.manifest
    }

    /// Returns the declared tools.
    #[must_use]
    pub fn tools(&self) -> &[ToolDefinition] {
        self.manifest.tools()
    }
}

/// Summary row for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    /// Server identifier.
    pub id: ServerId,
    /// Display name.
    pub name: String,
    /// Manifest version.
    pub version: String,
    /// Resolved runtime.
    pub runtime: RuntimeKind,
    /// Whether the server starts with the host.
    pub autostart: bool,
    /// Whether a live session exists.
    pub running: bool,
    /// Substrate of the live session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flavour: Option<&'static str>,
    /// Number of declared tools.
    pub tools: usize,
}

/// Tool exposed by a running server.
#[derive(Debug, Clone, PartialEq)]
pub struct RunningTool {
    /// `serverId/toolName` address.
    pub key: ToolKey,
    /// Tool definition from the manifest.
    pub definition: ToolDefinition,
}

struct ServerEntry {
    manifest: Arc<ServerManifest>,
    generation: u64,
    session: Option<Session>,
}

impl ServerEntry {
    fn live_session(&self) -> Option<&Session> {
        self.session
            .as_ref()
            .filter(|session| !session.transport.is_closed())
    }
}

#[derive(Default)]
struct RegistryState {
    servers: HashMap<ServerId, ServerEntry>,
    tool_index: BTreeMap<String, ToolIndexEntry>,
}

impl RegistryState {
    fn index_tools(&mut self, manifest: &ServerManifest) {
        self.unindex(manifest.id());
        for tool in manifest.tools() {
            self.tool_index.insert(
                index_key(manifest.id(), &tool.name),
                ToolIndexEntry {
                    server_id: manifest.id().clone(),
                    name: tool.name.clone(),
                },
            );
        }
    }

    fn unindex(&mut self, id: &ServerId) {
        self.tool_index.retain(|_, entry| &entry.server_id != id);
    }
}

fn index_key(server_id: &ServerId, tool: &str) -> String {
    format!("{server_id}:{tool}")
}

/// Holds installed manifests, their tool index, and their sessions.
pub struct ServerRegistry {
    store: Arc<dyn KeyValueStore>,
    launcher: Arc<dyn Launcher>,
    runtime: RuntimeContext,
    timeouts: Timeouts,
    observer: Option<Arc<dyn ToolListObserver>>,
    state: Arc<Mutex<RegistryState>>,
    start_locks: Mutex<HashMap<ServerId, Arc<tokio::sync::Mutex<()>>>>,
    persist_lock: tokio::sync::Mutex<()>,
    generations: AtomicU64,
}

impl fmt::Debug for ServerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        f.debug_struct("ServerRegistry")
            .field("servers", &state.servers.len())
            .field("tools", &state.tool_index.len())
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

impl ServerRegistry {
    /// Starts building a registry persisting manifests into `store`.
    #[must_use]
    pub fn builder(store: Arc<dyn KeyValueStore>) -> ServerRegistryBuilder {
        ServerRegistryBuilder {
            store,
            launcher: Arc::new(RuntimeLauncher),
            runtime: RuntimeContext::default(),
            timeouts: Timeouts::default(),
            observer: None,
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start_lock(&self, id: &ServerId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .start_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(id.clone()).or_default())
    }

    /// Returns the configured deadlines.
    #[must_use]
    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    /// Registers `manifest`, replacing any server with the same id and
    /// closing that server's session.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Manifest`] for an invalid manifest and
    /// [`KernelError::Store`] when the manifest list cannot be persisted.
    pub async fn register_server(&self, manifest: ServerManifest) -> KernelResult<ServerHandle> {
        manifest.validate()?;
        let (handle, previous) = self.install(manifest);
        if let Some(session) = previous {
            debug!(server_id = %handle.id(), "closing session of replaced server");
            session.transport.close().await;
        }
        self.persist().await?;
        info!(
            server_id = %handle.id(),
            tools = handle.tools().len(),
            runtime = handle.manifest().resolved_runtime().as_str(),
            "server registered"
        );
        Ok(handle)
    }

    fn install(&self, manifest: ServerManifest) -> (ServerHandle, Option<Session>) {
        let manifest = Arc::new(manifest);
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let mut state = self.lock_state();
        state.index_tools(&manifest);
        let previous = state.servers.insert(
            manifest.id().clone(),
            ServerEntry {
                manifest: Arc::clone(&manifest),
                generation,
                session: None,
            },
        );
        (
            ServerHandle { manifest },
            previous.and_then(|entry| entry.session),
        )
    }

    /// Removes a server, closing its session.
    ///
    /// Returns `false` when the id was not registered.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Store`] when the manifest list cannot be persisted.
    pub async fn unregister_server(&self, id: &ServerId) -> KernelResult<bool> {
        let removed = {
            let mut state = self.lock_state();
            let removed = state.servers.remove(id);
            if removed.is_some() {
                state.unindex(id);
            }
            removed
        };
        let Some(entry) = removed else {
            return Ok(false);
        };
        if let Some(session) = entry.session {
            session.transport.close().await;
        }
        self.start_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        self.persist().await?;
        info!(server_id = %id, "server unregistered");
        Ok(true)
    }

    /// Toggles autostart. Returns `false` when the id is not registered.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Store`] when the manifest list cannot be persisted.
    pub async fn set_autostart(&self, id: &ServerId, autostart: bool) -> KernelResult<bool> {
        let updated = {
            let mut state = self.lock_state();
            match state.servers.get_mut(id) {
                Some(entry) => {
                    let mut manifest = (*entry.manifest).clone();
                    manifest.set_autostart(autostart);
                    entry.manifest = Arc::new(manifest);
                    true
                }
                None => false,
            }
        };
        if updated {
            self.persist().await?;
            debug!(server_id = %id, autostart, "autostart updated");
        }
        Ok(updated)
    }

    async fn persist(&self) -> KernelResult<()> {
        let _guard = self.persist_lock.lock().await;
        let mut manifests: Vec<Arc<ServerManifest>> = self
            .lock_state()
            .servers
            .values()
            .map(|entry| Arc::clone(&entry.manifest))
            .collect();
        manifests.sort_by(|a, b| a.id().cmp(b.id()));
        let value = serde_json::to_value(
            manifests
                .iter()
                .map(|manifest| manifest.as_ref())
                .collect::<Vec<_>>(),
        )?;
        self.store.set(SERVERS_KEY, value).await?;
        Ok(())
    }

    /// Registers every persisted manifest without starting it. Malformed
    /// entries are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Store`] on read failure and
    /// [`KernelError::Internal`] when the stored list is not an array.
    pub async fn load_persisted(&self) -> KernelResult<usize> {
        let Some(value) = self.store.get(SERVERS_KEY).await? else {
            return Ok(0);
        };
        let Value::Array(entries) = value else {
            return Err(KernelError::Internal(format!(
                "`{SERVERS_KEY}` does not hold a manifest list"
            )));
        };

        let mut loaded = 0;
        for entry in entries {
            match ServerManifest::from_json(entry) {
                Ok(manifest) => {
                    self.install(manifest);
                    loaded += 1;
                }
                Err(err) => warn!(error = %err, "skipping persisted manifest"),
            }
        }
        info!(servers = loaded, "persisted servers loaded");
        Ok(loaded)
    }

    /// Starts every server marked autostart. Returns how many started.
    pub async fn start_autostart_servers(&self) -> usize {
        let mut ids: Vec<ServerId> = self
            .lock_state()
            .servers
            .values()
            .filter(|entry| entry.manifest.autostart())
            .map(|entry| entry.manifest.id().clone())
            .collect();
        ids.sort();

        let mut started = 0;
        for id in ids {
            if self.start_server(&id).await {
                started += 1;
            }
        }
        started
    }

    /// Returns a summary of every registered server, sorted by id.
    #[must_use]
    pub fn list_servers(&self) -> Vec<ServerStatus> {
        let state = self.lock_state();
        let mut servers: Vec<ServerStatus> = state
            .servers
            .values()
            .map(|entry| {
                let session = entry.live_session();
                ServerStatus {
                    id: entry.manifest.id().clone(),
                    name: entry.manifest.name().to_owned(),
                    version: entry.manifest.version().to_owned(),
                    runtime: entry.manifest.resolved_runtime(),
                    autostart: entry.manifest.autostart(),
                    running: session.is_some(),
                    flavour: session.map(|session| session.flavour.as_str()),
                    tools: entry.manifest.tools().len(),
                }
            })
            .collect();
        servers.sort_by(|a, b| a.id.cmp(&b.id));
        servers
    }

    /// Returns the handle registered under `id`.
    #[must_use]
    pub fn server(&self, id: &ServerId) -> Option<ServerHandle> {
        self.lock_state()
            .servers
            .get(id)
            .map(|entry| ServerHandle {
                manifest: Arc::clone(&entry.manifest),
            })
    }

    /// Returns `true` when `id` has a live session.
    #[must_use]
    pub fn is_running(&self, id: &ServerId) -> bool {
        self.lock_state()
            .servers
            .get(id)
            .is_some_and(|entry| entry.live_session().is_some())
    }

    /// Returns the live session of `id`.
    #[must_use]
    pub fn session(&self, id: &ServerId) -> Option<Session> {
        self.lock_state()
            .servers
            .get(id)
            .and_then(ServerEntry::live_session)
            .cloned()
    }

    /// Resolves `serverId:toolName` through the tool index.
    #[must_use]
    pub fn resolve_tool(&self, server_id: &ServerId, tool: &str) -> Option<ToolIndexEntry> {
        self.lock_state()
            .tool_index
            .get(&index_key(server_id, tool))
            .cloned()
    }

    /// Lists tools of running servers, optionally restricted to `filter`.
    #[must_use]
    pub fn running_tools(&self, filter: Option<&[ToolKey]>) -> Vec<RunningTool> {
        let state = self.lock_state();
        let mut tools: Vec<RunningTool> = state
            .servers
            .values()
            .filter(|entry| entry.live_session().is_some())
            .flat_map(|entry| {
                entry.manifest.tools().iter().map(|tool| RunningTool {
                    key: ToolKey::new(entry.manifest.id().clone(), tool.name.clone()),
                    definition: tool.clone(),
                })
            })
            .filter(|tool| filter.is_none_or(|allowed| allowed.contains(&tool.key)))
            .collect();
        tools.sort_by(|a, b| a.key.cmp(&b.key));
        tools
    }

    /// Starts `id`. Idempotent: returns `true` when a session already exists.
    /// Launch failures are logged and reported as `false`.
    pub async fn start_server(&self, id: &ServerId) -> bool {
        match self.try_start(id).await {
            Ok(()) => true,
            Err(err) => {
                warn!(server_id = %id, error = %err, "server failed to start");
                false
            }
        }
    }

    async fn try_start(&self, id: &ServerId) -> KernelResult<()> {
        let lock = self.start_lock(id);
        let _guard = lock.lock().await;

        let (manifest, generation) = {
            let state = self.lock_state();
            let entry = state
                .servers
                .get(id)
                .ok_or_else(|| KernelError::ServerNotFound(id.to_string()))?;
            if entry.live_session().is_some() {
                return Ok(());
            }
            (Arc::clone(&entry.manifest), entry.generation)
        };

        let launched = self.launcher.launch(&manifest, &self.runtime).await?;
        let session = Session::new(launched);

        let installed = {
            let mut state = self.lock_state();
            match state.servers.get_mut(id) {
                Some(entry) if entry.generation == generation => {
                    entry.session = Some(session.clone());
                    true
                }
                _ => false,
            }
        };
        if !installed {
            session.transport.close().await;
            return Err(KernelError::StartFailed {
                id: id.clone(),
                reason: "server was replaced or removed while starting".into(),
            });
        }

        self.watch_disconnect(id.clone(), &session);
        info!(
            server_id = %id,
            session_id = %session.id,
            flavour = session.flavour.as_str(),
            "server started"
        );
        Ok(())
    }

    fn watch_disconnect(&self, id: ServerId, session: &Session) {
        let state = Arc::clone(&self.state);
        let session_id = session.id;
        let mut closed = session.transport.closed_signal();
        tokio::spawn(async move {
            let _ = closed.wait_for(|closed| *closed).await;
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = state.servers.get_mut(&id) {
                if entry
                    .session
                    .as_ref()
                    .is_some_and(|session| session.id == session_id)
                {
                    entry.session = None;
                    warn!(server_id = %id, %session_id, "server channel closed, session removed");
                }
            }
        });
    }

    /// Stops `id`. Returns `false` when it is not registered or not started.
    pub async fn stop_server(&self, id: &ServerId) -> bool {
        let session = {
            let mut state = self.lock_state();
            state
                .servers
                .get_mut(id)
                .and_then(|entry| entry.session.take())
        };
        let Some(session) = session else {
            return false;
        };
        session.transport.close().await;
        info!(server_id = %id, session_id = %session.id, "server stopped");
        true
    }

    /// Stops and starts `id` again.
    pub async fn restart_server(&self, id: &ServerId) -> bool {
        self.stop_server(id).await;
        self.start_server(id).await
    }

    /// Starts `id`, probes `tools/list`, and on success stores the refreshed
    /// tools and enables autostart. A failed probe stops the server again so
    /// no half-started session remains.
    ///
    /// # Errors
    ///
    /// Returns the start or probe failure; the server is left stopped.
    pub async fn validate_and_start_server(
        &self,
        id: &ServerId,
    ) -> KernelResult<Vec<ToolDefinition>> {
        self.try_start(id).await?;

        let tools = match self.probe_tools(id).await {
            Ok(tools) => tools,
            Err(err) => {
                warn!(server_id = %id, error = %err, "tool probe failed, stopping server");
                self.stop_server(id).await;
                return Err(err);
            }
        };

        let manifest = {
            let mut state = self.lock_state();
            let Some(entry) = state.servers.get_mut(id) else {
                return Err(KernelError::ServerNotFound(id.to_string()));
            };
            let mut manifest = (*entry.manifest).clone();
            manifest.set_tools(tools.clone());
            manifest.set_autostart(true);
            let manifest = Arc::new(manifest);
            entry.manifest = Arc::clone(&manifest);
            state.index_tools(&manifest);
            manifest
        };
        self.persist().await?;
        info!(server_id = %id, tools = tools.len(), "server validated");

        if let Some(observer) = &self.observer {
            if let Err(err) = observer.tools_changed(&manifest).await {
                warn!(server_id = %id, error = %err, "tool list observer failed");
            }
        }
        Ok(tools)
    }

    async fn probe_tools(&self, id: &ServerId) -> KernelResult<Vec<ToolDefinition>> {
        let session = self
            .session(id)
            .ok_or_else(|| KernelError::ServerNotStarted(id.clone()))?;
        let response = session
            .transport
            .send(
                JsonRpcRequest::new(METHOD_TOOLS_LIST, None),
                self.timeouts.metadata,
            )
            .await
            .map_err(map_transport_error)?;
        let result = response.into_result().map_err(|err| {
            KernelError::Internal(format!("`{METHOD_TOOLS_LIST}` failed: {err}"))
        })?;
        let tools = result
            .get("tools")
            .cloned()
            .ok_or_else(|| KernelError::Internal("tool listing has no `tools` field".into()))?;
        let tools: Vec<ToolDefinition> = serde_json::from_value(tools)?;

        let mut names: Vec<&str> = tools.iter().map(|tool| tool.name.as_str()).collect();
        names.sort_unstable();
        if names.iter().any(|name| name.trim().is_empty()) || names.windows(2).any(|w| w[0] == w[1]) {
            return Err(KernelError::Internal(
                "tool listing contains empty or duplicate names".into(),
            ));
        }
        Ok(tools)
    }

    /// Closes every session.
    pub async fn shutdown(&self) {
        let sessions: Vec<(ServerId, Session)> = {
            let mut state = self.lock_state();
            state
                .servers
                .iter_mut()
                .filter_map(|(id, entry)| entry.session.take().map(|session| (id.clone(), session)))
                .collect()
        };
        for (id, session) in sessions {
            session.transport.close().await;
            debug!(server_id = %id, "session closed on shutdown");
        }
        info!("server registry shut down");
    }
}

pub(crate) fn map_transport_error(err: TransportError) -> KernelError {
    match err {
        TransportError::Timeout { method, after } => KernelError::Timeout { method, after },
        other => KernelError::Internal(other.to_string()),
    }
}

/// Builder for [`ServerRegistry`].
pub struct ServerRegistryBuilder {
    store: Arc<dyn KeyValueStore>,
    launcher: Arc<dyn Launcher>,
    runtime: RuntimeContext,
    timeouts: Timeouts,
    observer: Option<Arc<dyn ToolListObserver>>,
}

impl ServerRegistryBuilder {
    /// Overrides how runtimes are launched.
    #[must_use]
    pub fn launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Sets the context handed to launchers.
    #[must_use]
    pub fn runtime_context(mut self, runtime: RuntimeContext) -> Self {
        self.runtime = runtime;
        self
    }

    /// Sets call deadlines.
    #[must_use]
    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Installs the tool-list observer.
    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn ToolListObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Finalises the registry.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::InvalidConfig`] when a deadline is zero.
    pub fn build(self) -> KernelResult<ServerRegistry> {
        if self.timeouts.metadata.is_zero() {
            return Err(KernelError::InvalidConfig(
                "metadata timeout must be greater than zero",
            ));
        }
        if self.timeouts.tool_call.is_zero() {
            return Err(KernelError::InvalidConfig(
                "tool call timeout must be greater than zero",
            ));
        }
        Ok(ServerRegistry {
            store: self.store,
            launcher: self.launcher,
            runtime: self.runtime,
            timeouts: self.timeouts,
            observer: self.observer,
            state: Arc::new(Mutex::new(RegistryState::default())),
            start_locks: Mutex::new(HashMap::new()),
            persist_lock: tokio::sync::Mutex::new(()),
            generations: AtomicU64::new(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use toolhost_store::MemoryStore;

    fn manifest(id: &str, tools: &[&str]) -> ServerManifest {
        let mut builder = ServerManifest::builder(ServerId::new(id).unwrap())
            .name(id)
            .version("1.0.0")
            .script_source("export {}");
        for tool in tools {
            builder = builder.tool(ToolDefinition::new(*tool));
        }
        builder.build().unwrap()
    }

    fn registry(store: Arc<MemoryStore>) -> ServerRegistry {
        ServerRegistry::builder(store).build().unwrap()
    }

    #[tokio::test]
    async fn reregistering_replaces_tool_index() {
        let registry = registry(Arc::new(MemoryStore::new()));
        let id = ServerId::new("notes").unwrap();
        registry.register_server(manifest("notes", &["append", "read"])).await.unwrap();
        assert!(registry.resolve_tool(&id, "append").is_some());

        registry.register_server(manifest("notes", &["read"])).await.unwrap();
        assert!(registry.resolve_tool(&id, "append").is_none());
        assert_eq!(
            registry.resolve_tool(&id, "read"),
            Some(ToolIndexEntry {
                server_id: id.clone(),
                name: "read".into()
            })
        );
    }

    #[tokio::test]
    async fn reregistering_closes_the_previous_session() {
        let registry = registry(Arc::new(MemoryStore::new()));
        let id = ServerId::new("notes").unwrap();
        registry.register_server(manifest("notes", &["append"])).await.unwrap();
        assert!(registry.start_server(&id).await);
        let old = registry.session(&id).unwrap();

        registry.register_server(manifest("notes", &["append"])).await.unwrap();
        assert!(old.transport().is_closed());
        assert!(!registry.is_running(&id));
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let registry = registry(Arc::new(MemoryStore::new()));
        let id = ServerId::new("notes").unwrap();
        registry.register_server(manifest("notes", &["append"])).await.unwrap();

        assert!(registry.start_server(&id).await);
        let first = registry.session(&id).unwrap().id();
        assert!(registry.start_server(&id).await);
        assert_eq!(registry.session(&id).unwrap().id(), first);
    }

    #[tokio::test]
    async fn stop_requires_a_started_server() {
        let registry = registry(Arc::new(MemoryStore::new()));
        let id = ServerId::new("notes").unwrap();
        assert!(!registry.stop_server(&id).await);

        registry.register_server(manifest("notes", &["append"])).await.unwrap();
        assert!(!registry.stop_server(&id).await);

        assert!(registry.start_server(&id).await);
        assert!(registry.stop_server(&id).await);
        assert!(!registry.stop_server(&id).await);
        assert!(registry.server(&id).is_some());
    }

    #[tokio::test]
    async fn start_unknown_server_is_false() {
        let registry = registry(Arc::new(MemoryStore::new()));
        assert!(!registry.start_server(&ServerId::new("ghost").unwrap()).await);
    }

    #[tokio::test]
    async fn unregister_closes_session_and_index() {
        let registry = registry(Arc::new(MemoryStore::new()));
        let id = ServerId::new("notes").unwrap();
        registry.register_server(manifest("notes", &["append"])).await.unwrap();
        assert!(registry.start_server(&id).await);
        let session = registry.session(&id).unwrap();

        assert!(registry.unregister_server(&id).await.unwrap());
        assert!(session.transport().is_closed());
        assert!(registry.resolve_tool(&id, "append").is_none());
        assert!(!registry.unregister_server(&id).await.unwrap());
    }

    #[tokio::test]
    async fn manifests_round_trip_through_the_store() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(Arc::clone(&store));
        registry.register_server(manifest("alpha", &["one"])).await.unwrap();
        registry.register_server(manifest("beta", &["two"])).await.unwrap();
        assert!(registry.set_autostart(&ServerId::new("beta").unwrap(), true).await.unwrap());

        let restored = ServerRegistry::builder(store).build().unwrap();
        assert_eq!(restored.load_persisted().await.unwrap(), 2);
        let servers = restored.list_servers();
        assert_eq!(servers.len(), 2);
        assert!(!servers[0].autostart);
        assert!(servers[1].autostart);

        assert_eq!(restored.start_autostart_servers().await, 1);
        assert!(restored.is_running(&ServerId::new("beta").unwrap()));
        assert!(!restored.is_running(&ServerId::new("alpha").unwrap()));
    }

    #[tokio::test]
    async fn running_tools_respects_filter() {
        let registry = registry(Arc::new(MemoryStore::new()));
        registry.register_server(manifest("alpha", &["one", "two"])).await.unwrap();
        registry.register_server(manifest("beta", &["three"])).await.unwrap();
        assert!(registry.start_server(&ServerId::new("alpha").unwrap()).await);

        let all = registry.running_tools(None);
        assert_eq!(all.len(), 2);

        let only: ToolKey = "alpha/two".parse().unwrap();
        let filtered = registry.running_tools(Some(std::slice::from_ref(&only)));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].key, only);
    }

    #[tokio::test]
    async fn zero_timeouts_are_rejected() {
        let err = ServerRegistry::builder(Arc::new(MemoryStore::new()))
            .timeouts(Timeouts {
                metadata: Duration::ZERO,
                tool_call: Duration::from_secs(1),
            })
            .build()
            .err()
            .expect("zero timeout");
        assert!(matches!(err, KernelError::InvalidConfig(_)));
    }
}
