//! In-process workers for the fixed set of builtin script servers.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::{Value, json};
use thiserror::Error;
use toolhost_primitives::ToolDefinition;
use toolhost_transport::{
    INTERNAL_ERROR, INVALID_PARAMS, JsonRpcError, LocalPeer, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST,
};

/// Server id of the builtin echo worker.
pub const BUILTIN_ECHO: &str = "builtin-echo";
/// Server id of the builtin clock worker.
pub const BUILTIN_CLOCK: &str = "builtin-clock";

/// Result alias for builtin tool operations.
pub type ToolResult<T> = Result<T, ToolError>;

/// Errors produced by builtin tool registration and invocation.
#[derive(Debug, Error)]
pub enum ToolError {
    /// Tool name collided with an existing registration.
    #[error("tool `{name}` is already registered")]
    DuplicateTool {
        /// Name of the offending tool.
        name: String,
    },

    /// Requested tool does not exist.
    #[error("tool `{name}` is not registered")]
    UnknownTool {
        /// Name of the missing tool.
        name: String,
    },

    /// Tool execution failed.
    #[error("tool execution failed: {reason}")]
    Execution {
        /// Human-readable error returned by the tool implementation.
        reason: String,
    },
}

impl From<ToolError> for JsonRpcError {
    fn from(err: ToolError) -> Self {
        let code = match err {
            ToolError::UnknownTool { .. } => INVALID_PARAMS,
            ToolError::DuplicateTool { .. } | ToolError::Execution { .. } => INTERNAL_ERROR,
        };
        JsonRpcError::new(code, err.to_string())
    }
}

/// Trait implemented by builtin tool bodies.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Invokes the tool with the given JSON arguments.
    async fn invoke(&self, arguments: Value) -> ToolResult<Value>;
}

#[async_trait]
impl<F, Fut> Tool for F
where
    F: Send + Sync + Fn(Value) -> Fut,
    Fut: Future<Output = ToolResult<Value>> + Send,
{
    async fn invoke(&self, arguments: Value) -> ToolResult<Value> {
        (self)(arguments).await
    }
}

#[derive(Clone)]
struct ToolHandle {
    definition: ToolDefinition,
    executor: Arc<dyn Tool>,
}

/// Name-keyed set of builtin tools, listed in name order.
#[derive(Default)]
pub struct ToolRegistry {
    inner: RwLock<BTreeMap<String, ToolHandle>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("ToolRegistry")
            .field("registered", &inner.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool body under its definition.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::DuplicateTool`] if the name is already present.
    pub fn register_tool<T>(&self, definition: ToolDefinition, tool: T) -> ToolResult<()>
    where
        T: Tool + 'static,
    {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let name = definition.name.clone();
        if inner.contains_key(&name) {
            return Err(ToolError::DuplicateTool { name });
        }
        inner.insert(
            name,
            ToolHandle {
                definition,
                executor: Arc::new(tool),
            },
        );
        Ok(())
    }

    /// Invokes a registered tool.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::UnknownTool`] when the tool is not found or
    /// propagates [`ToolError::Execution`] when the body fails.
    pub async fn invoke(&self, name: &str, arguments: Value) -> ToolResult<Value> {
        let handle = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| ToolError::UnknownTool {
                name: name.to_owned(),
            })?;
        handle.executor.invoke(arguments).await
    }

    /// Lists the definitions of all registered tools.
    #[must_use]
    pub fn list(&self) -> Vec<ToolDefinition> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|handle| handle.definition.clone())
            .collect()
    }
}

fn text_content(text: impl Into<String>) -> Value {
    json!({ "content": [{ "type": "text", "text": text.into() }] })
}

fn echo_registry() -> ToolResult<ToolRegistry> {
    let registry = ToolRegistry::new();
    registry.register_tool(
        ToolDefinition::new("echo")
            .with_description("Returns the supplied text unchanged")
            .with_input_schema(json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            })),
        |arguments: Value| async move {
            match arguments.get("text").and_then(Value::as_str) {
                Some(text) => Ok(text_content(text)),
                None => Err(ToolError::Execution {
                    reason: "missing string argument `text`".into(),
                }),
            }
        },
    )?;
    Ok(registry)
}

fn clock_registry() -> ToolResult<ToolRegistry> {
    let registry = ToolRegistry::new();
    registry.register_tool(
        ToolDefinition::new("now").with_description("Returns the current UTC time"),
        |_arguments: Value| async move {
            let now = Utc::now();
            let mut result = text_content(now.to_rfc3339_opts(SecondsFormat::Millis, true));
            result["epochMillis"] = json!(now.timestamp_millis());
            Ok(result)
        },
    )?;
    Ok(registry)
}

/// Returns the registry for a builtin server id, or `None` when the id is not
/// builtin.
#[must_use]
pub fn builtin_registry(server_id: &str) -> Option<ToolRegistry> {
    let registry = match server_id {
        BUILTIN_ECHO => echo_registry(),
        BUILTIN_CLOCK => clock_registry(),
        _ => return None,
    };
    registry.ok()
}

/// [`LocalPeer`] answering `tools/list` and `tools/call` from a registry.
#[derive(Debug)]
pub struct BuiltinWorker {
    registry: ToolRegistry,
}

impl BuiltinWorker {
    /// Wraps a registry.
    #[must_use]
    pub fn new(registry: ToolRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl LocalPeer for BuiltinWorker {
    async fn serve(&self, method: &str, params: Option<Value>) -> Result<Value, JsonRpcError> {
        match method {
            METHOD_TOOLS_LIST => Ok(json!({ "tools": self.registry.list() })),
            METHOD_TOOLS_CALL => {
                let params = params.unwrap_or_default();
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| JsonRpcError::new(INVALID_PARAMS, "missing tool name"))?;
                let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
                Ok(self.registry.invoke(name, arguments).await?)
            }
            other => Err(JsonRpcError::method_not_found(other)),
        }
    }
}
