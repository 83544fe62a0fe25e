//! Declarative description of a tool server's identity, runtime, and tools.

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ServerId;
use crate::error::{Error, Result};

/// Execution substrate hosting a tool server.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// Sandboxed WebAssembly module speaking JSON-RPC over stdio.
    Wasm,
    /// Sandboxed interpreted script.
    Js,
    /// Remote peer reached over SSE or WebSocket.
    Remote,
}

impl RuntimeKind {
    /// Returns the lowercase label used in manifests and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Wasm => "wasm",
            Self::Js => "js",
            Self::Remote => "remote",
        }
    }
}

/// Channel flavour used to reach a remote server.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteTransportKind {
    /// Server-sent events for responses, HTTP POST for requests.
    #[default]
    Sse,
    /// Full-duplex WebSocket.
    WebSocket,
}

/// Tool exposed by a server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    /// Tool name, unique within its server.
    pub name: String,
    /// Optional human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema describing the tool arguments.
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
}

impl ToolDefinition {
    /// Creates a tool definition with an empty object schema.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            input_schema: empty_object_schema(),
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets the input schema.
    #[must_use]
    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

/// Network hosts a sandbox may reach.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkCapability {
    /// Host names (optionally with port) the sandbox may contact.
    #[serde(default)]
    pub hosts: Vec<String>,
}

/// Filesystem paths a sandbox may touch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemCapability {
    /// Readable paths.
    #[serde(default)]
    pub read: Vec<PathBuf>,
    /// Writable paths.
    #[serde(default)]
    pub write: Vec<PathBuf>,
}

/// Capabilities declared by the manifest.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Network access.
    #[serde(default)]
    pub network: NetworkCapability,
    /// Filesystem access.
    #[serde(default)]
    pub filesystem: FilesystemCapability,
}

/// Secret the server expects the host to inject.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretDeclaration {
    /// Environment variable name.
    pub name: String,
    /// Optional description shown when prompting for the value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether the server refuses to start without the secret.
    #[serde(default)]
    pub required: bool,
}

/// OAuth token the server needs at start time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthRequirement {
    /// Provider identifier (e.g. `google`).
    pub provider: String,
    /// Requested provider scopes.
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Human-readable description of a tool server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerManifest {
    id: ServerId,
    name: String,
    version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    runtime: Option<RuntimeKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    module_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    module_base64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    script_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    script_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    remote_url: Option<String>,
    #[serde(default)]
    remote_transport: RemoteTransportKind,
    #[serde(default)]
    capabilities: Capabilities,
    #[serde(default)]
    tools: Vec<ToolDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    secrets: Vec<SecretDeclaration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    oauth: Option<OAuthRequirement>,
    #[serde(default)]
    autostart: bool,
}

impl ServerManifest {
    /// Starts building a [`ServerManifest`].
    #[must_use]
    pub fn builder(id: ServerId) -> ServerManifestBuilder {
        ServerManifestBuilder {
            manifest: Self {
                id,
                name: String::new(),
                version: String::new(),
                runtime: None,
                module_path: None,
                module_base64: None,
                script_path: None,
                script_source: None,
                remote_url: None,
                remote_transport: RemoteTransportKind::default(),
                capabilities: Capabilities::default(),
                tools: Vec::new(),
                secrets: Vec::new(),
                oauth: None,
                autostart: false,
            },
        }
    }

    /// Parses and validates a manifest from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidManifest`] when the JSON does not describe a
    /// valid manifest.
    pub fn from_json(value: Value) -> Result<Self> {
        let manifest: Self = serde_json::from_value(value)
            .map_err(|err| Error::manifest(format!("malformed manifest: {err}")))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Checks the structural invariants of the manifest.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidManifest`] when a required field is empty or
    /// tool names collide.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::manifest("manifest name cannot be empty"));
        }
        if self.version.trim().is_empty() {
            return Err(Error::manifest("manifest version cannot be empty"));
        }

        let mut seen = BTreeSet::new();
        for tool in &self.tools {
            if tool.name.trim().is_empty() {
                return Err(Error::manifest("tool name cannot be empty"));
            }
            if !seen.insert(tool.name.as_str()) {
                return Err(Error::manifest(format!(
                    "tool `{}` is declared twice",
                    tool.name
                )));
            }
        }

        for secret in &self.secrets {
            if secret.name.trim().is_empty() {
                return Err(Error::manifest("secret name cannot be empty"));
            }
        }

        Ok(())
    }

    /// Resolves the runtime: explicit field, then remote URL, then script
    /// fields, defaulting to wasm.
    #[must_use]
    pub fn resolved_runtime(&self) -> RuntimeKind {
        if let Some(runtime) = self.runtime {
            return runtime;
        }
        if self.remote_url.is_some() {
            return RuntimeKind::Remote;
        }
        if self.script_path.is_some() || self.script_source.is_some() {
            return RuntimeKind::Js;
        }
        RuntimeKind::Wasm
    }

    /// Returns the server identifier.
    #[must_use]
    pub fn id(&self) -> &ServerId {
        &self.id
    }

    /// Returns the display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the version string.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Returns the explicit runtime, if declared.
    #[must_use]
    pub fn runtime(&self) -> Option<RuntimeKind> {
        self.runtime
    }

    /// Returns the path of the wasm module, if declared.
    #[must_use]
    pub fn module_path(&self) -> Option<&PathBuf> {
        self.module_path.as_ref()
    }

    /// Returns the inline base64-encoded wasm module, if declared.
    #[must_use]
    pub fn module_base64(&self) -> Option<&str> {
        self.module_base64.as_deref()
    }

    /// Returns the script entry point path, if declared.
    #[must_use]
    pub fn script_path(&self) -> Option<&PathBuf> {
        self.script_path.as_ref()
    }

    /// Returns the inline script source, if declared.
    #[must_use]
    pub fn script_source(&self) -> Option<&str> {
        self.script_source.as_deref()
    }

    /// Returns the remote endpoint URL, if declared.
    #[must_use]
    pub fn remote_url(&self) -> Option<&str> {
        self.remote_url.as_deref()
    }

    /// Returns the remote channel flavour.
    #[must_use]
    pub fn remote_transport(&self) -> RemoteTransportKind {
        self.remote_transport
    }

    /// Returns the declared capabilities.
    #[must_use]
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Returns the declared tools.
    #[must_use]
    pub fn tools(&self) -> &[ToolDefinition] {
        &self.tools
    }

    /// Returns the declared secrets.
    #[must_use]
    pub fn secrets(&self) -> &[SecretDeclaration] {
        &self.secrets
    }

    /// Returns the OAuth requirement, if any.
    #[must_use]
    pub fn oauth(&self) -> Option<&OAuthRequirement> {
        self.oauth.as_ref()
    }

    /// Returns whether the server starts with the host.
    #[must_use]
    pub fn autostart(&self) -> bool {
        self.autostart
    }

    /// Replaces the declared tool list (after a successful tool-listing probe).
    pub fn set_tools(&mut self, tools: Vec<ToolDefinition>) {
        self.tools = tools;
    }

    /// Toggles autostart.
    pub fn set_autostart(&mut self, autostart: bool) {
        self.autostart = autostart;
    }
}

/// Builder for [`ServerManifest`].
#[derive(Debug)]
pub struct ServerManifestBuilder {
    manifest: ServerManifest,
}

impl ServerManifestBuilder {
    /// Sets the display name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.manifest.name = name.into();
        self
    }

    /// Sets the version string.
    #[must_use]
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.manifest.version = version.into();
        self
    }

    /// Declares the runtime explicitly.
    #[must_use]
    pub fn runtime(mut self, runtime: RuntimeKind) -> Self {
        self.manifest.runtime = Some(runtime);
        self
    }

    /// Points at a wasm module on disk.
    #[must_use]
    pub fn module_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.manifest.module_path = Some(path.into());
        self
    }

    /// Embeds a base64-encoded wasm module.
    #[must_use]
    pub fn module_base64(mut self, encoded: impl Into<String>) -> Self {
        self.manifest.module_base64 = Some(encoded.into());
        self
    }

    /// Points at a script entry point on disk.
    #[must_use]
    pub fn script_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.manifest.script_path = Some(path.into());
        self
    }

    /// Embeds script source.
    #[must_use]
    pub fn script_source(mut self, source: impl Into<String>) -> Self {
        self.manifest.script_source = Some(source.into());
        self
    }

    /// Sets the remote endpoint.
    #[must_use]
    pub fn remote(mut self, url: impl Into<String>, transport: RemoteTransportKind) -> Self {
        self.manifest.remote_url = Some(url.into());
        self.manifest.remote_transport = transport;
        self
    }

    /// Replaces the capability declarations.
    #[must_use]
    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.manifest.capabilities = capabilities;
        self
    }

    /// Adds a tool definition.
    #[must_use]
    pub fn tool(mut self, tool: ToolDefinition) -> Self {
        self.manifest.tools.push(tool);
        self
    }

    /// Adds a secret declaration.
    #[must_use]
    pub fn secret(mut self, secret: SecretDeclaration) -> Self {
        self.manifest.secrets.push(secret);
        self
    }

    /// Declares an OAuth requirement.
    #[must_use]
    pub fn oauth(mut self, oauth: OAuthRequirement) -> Self {
        self.manifest.oauth = Some(oauth);
        self
    }

    /// Sets the autostart flag.
    #[must_use]
    pub fn autostart(mut self, autostart: bool) -> Self {
        self.manifest.autostart = autostart;
        self
    }

    /// Consumes the builder and returns the validated manifest.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidManifest`] if mandatory fields are missing or
    /// tool names collide.
    pub fn build(self) -> Result<ServerManifest> {
        self.manifest.validate()?;
        Ok(self.manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(raw: &str) -> ServerId {
        ServerId::new(raw).unwrap()
    }

    #[test]
    fn builds_manifest() {
        let manifest = ServerManifest::builder(id("weather"))
            .name("Weather")
            .version("1.2.3")
            .tool(ToolDefinition::new("forecast").with_description("Daily forecast"))
            .autostart(true)
            .build()
            .unwrap();

        assert_eq!(manifest.name(), "Weather");
        assert_eq!(manifest.tools().len(), 1);
        assert!(manifest.autostart());
        assert_eq!(manifest.resolved_runtime(), RuntimeKind::Wasm);
    }

    #[test]
    fn name_is_required() {
        let result = ServerManifest::builder(id("nameless")).version("1").build();
        assert!(result.is_err());
    }

    #[test]
    fn duplicate_tools_are_rejected() {
        let err = ServerManifest::builder(id("dup"))
            .name("Dup")
            .version("1")
            .tool(ToolDefinition::new("a"))
            .tool(ToolDefinition::new("a"))
            .build()
            .expect_err("duplicate");
        assert!(matches!(err, Error::InvalidManifest { .. }));
    }

    #[test]
    fn runtime_inference_order() {
        let base = || ServerManifest::builder(id("infer")).name("Infer").version("1");

        let remote = base()
            .remote("https://tools.example.com/sse", RemoteTransportKind::Sse)
            .script_source("export {}")
            .build()
            .unwrap();
        assert_eq!(remote.resolved_runtime(), RuntimeKind::Remote);

        let script = base().script_source("export {}").build().unwrap();
        assert_eq!(script.resolved_runtime(), RuntimeKind::Js);

        let explicit = base()
            .runtime(RuntimeKind::Wasm)
            .remote("wss://tools.example.com", RemoteTransportKind::WebSocket)
            .build()
            .unwrap();
        assert_eq!(explicit.resolved_runtime(), RuntimeKind::Wasm);
    }

    #[test]
    fn parses_camel_case_json() {
        let manifest = ServerManifest::from_json(json!({
            "id": "search",
            "name": "Search",
            "version": "0.1.0",
            "remoteUrl": "wss://search.example.com/rpc",
            "remoteTransport": "websocket",
            "capabilities": { "network": { "hosts": ["search.example.com"] } },
            "tools": [{ "name": "query", "inputSchema": { "type": "object" } }],
            "oauth": { "provider": "google", "scopes": ["drive.readonly"] }
        }))
        .unwrap();

        assert_eq!(manifest.resolved_runtime(), RuntimeKind::Remote);
        assert_eq!(manifest.remote_transport(), RemoteTransportKind::WebSocket);
        assert_eq!(manifest.capabilities().network.hosts, ["search.example.com"]);
        assert_eq!(manifest.oauth().map(|o| o.provider.as_str()), Some("google"));
        assert!(!manifest.autostart());
    }

    #[test]
    fn malformed_json_is_a_manifest_error() {
        let err = ServerManifest::from_json(json!({ "id": "x" })).expect_err("missing fields");
        assert!(matches!(err, Error::InvalidManifest { .. }));
    }
}
