//! Policy layer in front of the gateway.

use std::sync::Arc;

use serde_json::Value;
use toolhost_permissions::{PermissionEngine, TabId};
use toolhost_primitives::{Origin, Scope, ToolKey};
use tracing::{debug, info};

use crate::gateway::{CallContext, ToolCallResult, ToolGateway};
use crate::registry::RunningTool;
use crate::KernelResult;

/// Checks an origin's grants before listing or invoking tools.
#[derive(Debug, Clone)]
pub struct ToolRouter {
    permissions: Arc<PermissionEngine>,
    gateway: Arc<ToolGateway>,
}

impl ToolRouter {
    /// Creates a router.
    #[must_use]
    pub fn new(permissions: Arc<PermissionEngine>, gateway: Arc<ToolGateway>) -> Self {
        Self {
            permissions,
            gateway,
        }
    }

    /// Returns the underlying gateway.
    #[must_use]
    pub fn gateway(&self) -> &Arc<ToolGateway> {
        &self.gateway
    }

    /// Lists tools of running servers visible to `origin`. A non-empty
    /// allowlist narrows the listing.
    ///
    /// # Errors
    ///
    /// Returns [`crate::KernelError::PermissionDenied`] without `mcp:tools.list`.
    pub async fn list_tools(&self, origin: &Origin) -> KernelResult<Vec<RunningTool>> {
        self.permissions
            .check_permissions(origin, &[Scope::ToolsList])
            .await?;
        let status = self.permissions.get_permissions(origin).await?;
        let tools = self.gateway.registry().running_tools(None);
        Ok(match status.allowed_tools.filter(|allowed| !allowed.is_empty()) {
            Some(allowed) => tools
                .into_iter()
                .filter(|tool| allowed.contains(&tool.key.to_string()))
                .collect(),
            None => tools,
        })
    }

    /// Invokes `tool` for `origin` after checking `mcp:tools.call` and the
    /// allowlist. Allowlist entries are `serverId/toolName` keys.
    ///
    /// # Errors
    ///
    /// Returns [`crate::KernelError::PermissionDenied`] or
    /// [`crate::KernelError::ToolNotAllowed`]; failures of the call itself are
    /// reported inside the [`ToolCallResult`].
    pub async fn call_tool(
        &self,
        origin: &Origin,
        tool: &ToolKey,
        arguments: Value,
        tab_id: Option<TabId>,
    ) -> KernelResult<ToolCallResult> {
        self.permissions
            .check_permissions(origin, &[Scope::ToolsCall])
            .await?;
        self.permissions
            .ensure_tool_allowed(origin, &tool.to_string())
            .await?;
        info!(origin = %origin, tool = %tool, "routing tool call");

        let context = CallContext {
            origin: origin.clone(),
            tab_id,
        };
        let result = self
            .gateway
            .call_tool(
                tool.server_id().as_str(),
                tool.tool(),
                arguments,
                Some(&context),
            )
            .await;
        debug!(origin = %origin, tool = %tool, ok = result.ok, "tool call routed");
        Ok(result)
    }
}
