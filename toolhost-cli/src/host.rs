//! Wires configuration into a registry, permission engine, and runtimes.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use toolhost_config::HostConfig;
use toolhost_kernel::{
    HostBridge, HostCapabilities, KernelError, KernelResult, ServerRegistry, Timeouts, ToolGateway,
    ToolRouter,
};
use toolhost_permissions::{KvGrantStore, PermissionEngine, TabId};
use toolhost_runtimes::{RuntimeContext, ScriptSettings, StaticSecrets};
use toolhost_store::{FileStore, KeyValueStore};
use tracing::{debug, info};

/// Tab capture needs a browser; a terminal host refuses it.
struct HeadlessCapabilities;

#[async_trait]
impl HostCapabilities for HeadlessCapabilities {
    async fn capture_visible_tab(&self, tab_id: Option<TabId>) -> KernelResult<String> {
        debug!(?tab_id, "tab capture requested in headless host");
        Err(KernelError::Internal(
            "tab capture is not available from the command line".into(),
        ))
    }
}

pub struct Host {
    pub config: HostConfig,
    pub registry: Arc<ServerRegistry>,
    pub permissions: Arc<PermissionEngine>,
}

impl Host {
    pub async fn open(config: HostConfig, secrets: &[(String, String)]) -> anyhow::Result<Self> {
        let store: Arc<dyn KeyValueStore> = Arc::new(
            FileStore::open(&config.storage.path)
                .await
                .with_context(|| format!("opening {}", config.storage.path.display()))?,
        );

        let secrets = secrets
            .iter()
            .fold(StaticSecrets::new(), |acc, (name, value)| {
                acc.with(name.clone(), value.clone())
            });
        let bridge = HostBridge::new(
            config.host.trusted_origin.clone(),
            Arc::new(HeadlessCapabilities),
        );
        let runtime = RuntimeContext {
            script: ScriptSettings {
                command: config.script.command.clone(),
                args: config.script.args.clone(),
            },
            fuel_per_call: config.wasm.fuel_per_call,
            connect_timeout: config.connect_timeout(),
            tokens: None,
            secrets: Some(Arc::new(secrets)),
            host: Some(Arc::new(bridge)),
        };

        let registry = ServerRegistry::builder(Arc::clone(&store))
            .runtime_context(runtime)
            .timeouts(Timeouts {
                metadata: config.metadata_timeout(),
                tool_call: config.tool_call_timeout(),
            })
            .build()?;
        let loaded = registry.load_persisted().await?;

        let permissions = PermissionEngine::builder(Arc::new(KvGrantStore::new(store)))
            .once_ttl(config.once_ttl())
            .build()?;

        info!(servers = loaded, path = %config.storage.path.display(), "host opened");
        Ok(Self {
            config,
            registry: Arc::new(registry),
            permissions: Arc::new(permissions),
        })
    }

    pub fn gateway(&self) -> Arc<ToolGateway> {
        Arc::new(ToolGateway::new(Arc::clone(&self.registry)))
    }

    pub fn router(&self) -> ToolRouter {
        ToolRouter::new(Arc::clone(&self.permissions), self.gateway())
    }

    pub async fn close(&self) {
        self.registry.shutdown().await;
    }
}
