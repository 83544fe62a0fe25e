//! Last-resort peer for script servers with no runnable implementation.

use async_trait::async_trait;
use serde_json::{Value, json};
use toolhost_primitives::ToolDefinition;
use toolhost_transport::{JsonRpcError, LocalPeer, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST};

/// Answers `tools/list` from the manifest and echoes a placeholder for calls.
#[derive(Debug, Clone)]
pub struct StubPeer {
    server_name: String,
    tools: Vec<ToolDefinition>,
}

impl StubPeer {
    /// Creates a stub advertising `tools`.
    #[must_use]
    pub fn new(server_name: impl Into<String>, tools: Vec<ToolDefinition>) -> Self {
        Self {
            server_name: server_name.into(),
            tools,
        }
    }
}

#[async_trait]
impl LocalPeer for StubPeer {
    async fn serve(&self, method: &str, params: Option<Value>) -> Result<Value, JsonRpcError> {
        match method {
            METHOD_TOOLS_LIST => Ok(json!({ "tools": self.tools })),
            METHOD_TOOLS_CALL => {
                let name = params
                    .as_ref()
                    .and_then(|p| p.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                Ok(json!({
                    "content": [{
                        "type": "text",
                        "text": format!(
                            "{} has no runnable implementation; `{name}` was not executed",
                            self.server_name
                        ),
                    }],
                    "stub": true,
                }))
            }
            other => Err(JsonRpcError::method_not_found(other)),
        }
    }
}
