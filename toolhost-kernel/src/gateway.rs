//! Tool invocation gateway.
//!
//! The gateway performs no permission checks; [`crate::ToolRouter`] does that
//! before delegating here.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use toolhost_permissions::TabId;
use toolhost_primitives::{Origin, ServerId, ToolKey};
use toolhost_transport::{JsonRpcRequest, METHOD_TOOLS_CALL};
use tracing::{debug, warn};

use crate::registry::{ServerRegistry, map_transport_error};
use crate::KernelError;

/// Caller identity forwarded to the server as `_meta.context`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallContext {
    /// Requesting origin.
    pub origin: Origin,
    /// Tab the request came from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<TabId>,
}

impl CallContext {
    /// Creates a context for `origin`.
    #[must_use]
    pub fn new(origin: Origin) -> Self {
        Self {
            origin,
            tab_id: None,
        }
    }

    /// Tags the context with a tab.
    #[must_use]
    pub fn with_tab(mut self, tab_id: TabId) -> Self {
        self.tab_id = Some(tab_id);
        self
    }
}

/// Outcome of a tool call: `{ok, result?, error?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    /// Whether the call succeeded.
    pub ok: bool,
    /// Tool output on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Single error string on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolCallResult {
    /// Successful outcome.
    #[must_use]
    pub fn success(result: Value) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    /// Failed outcome.
    #[must_use]
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Converts into a standard result.
    ///
    /// # Errors
    ///
    /// Returns the error string of a failed call.
    pub fn into_result(self) -> Result<Value, String> {
        if self.ok {
            Ok(self.result.unwrap_or(Value::Null))
        } else {
            Err(self.error.unwrap_or_else(|| "tool call failed".to_owned()))
        }
    }
}

/// Forwards tool calls to running servers.
#[derive(Debug, Clone)]
pub struct ToolGateway {
    registry: Arc<ServerRegistry>,
    timeout: Duration,
}

impl ToolGateway {
    /// Creates a gateway using the registry's tool-call deadline.
    #[must_use]
    pub fn new(registry: Arc<ServerRegistry>) -> Self {
        let timeout = registry.timeouts().tool_call;
        Self { registry, timeout }
    }

    /// Overrides the per-call deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the registry calls are resolved against.
    #[must_use]
    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    /// Invokes `tool_name` on `server_id`. Never fails outward: every error is
    /// folded into [`ToolCallResult::failure`].
    pub async fn call_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: Value,
        context: Option<&CallContext>,
    ) -> ToolCallResult {
        match self.try_call(server_id, tool_name, arguments, context).await {
            Ok(result) => {
                debug!(server_id, tool = tool_name, "tool call succeeded");
                ToolCallResult::success(result)
            }
            Err(error) => {
                warn!(server_id, tool = tool_name, %error, "tool call failed");
                ToolCallResult::failure(error)
            }
        }
    }

    async fn try_call(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: Value,
        context: Option<&CallContext>,
    ) -> Result<Value, String> {
        let id = ServerId::new(server_id)
            .map_err(|_| KernelError::ServerNotFound(server_id.to_owned()).to_string())?;
        let entry = self.registry.resolve_tool(&id, tool_name).ok_or_else(|| {
            if self.registry.server(&id).is_some() {
                KernelError::ToolNotFound {
                    server_id: server_id.to_owned(),
                    tool: tool_name.to_owned(),
                }
            } else {
                KernelError::ServerNotFound(server_id.to_owned())
            }
            .to_string()
        })?;
        let session = self
            .registry
            .session(&entry.server_id)
            .ok_or_else(|| KernelError::ServerNotStarted(entry.server_id.clone()).to_string())?;
        let key = ToolKey::new(entry.server_id, entry.name);

        let mut params = Map::new();
        params.insert("name".into(), Value::String(key.tool().to_owned()));
        params.insert("arguments".into(), normalise_arguments(arguments));
        if let Some(context) = context {
            params.insert("_meta".into(), json!({ "context": context }));
        }

        let response = session
            .transport()
            .send(
                JsonRpcRequest::new(METHOD_TOOLS_CALL, Some(Value::Object(params))),
                self.timeout,
            )
            .await
            .map_err(|err| format!("tool `{key}` failed: {}", map_transport_error(err)))?;

        let result = response.into_result().map_err(|err| {
            format!("tool `{key}` failed: {} (code {})", err.message, err.code)
        })?;

        if result.get("isError").and_then(Value::as_bool) == Some(true) {
            return Err(format!(
                "tool `{key}` reported an error: {}",
                content_text(&result).unwrap_or_else(|| result.to_string())
            ));
        }
        Ok(result)
    }
}

fn normalise_arguments(arguments: Value) -> Value {
    match arguments {
        Value::Null => Value::Object(Map::new()),
        other => other,
    }
}

/// Joins the `text` parts of an MCP-style `content` array.
pub(crate) fn content_text(result: &Value) -> Option<String> {
    let parts: Vec<&str> = result
        .get("content")?
        .as_array()?
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}
