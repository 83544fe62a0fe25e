//! Permission scopes gating categories of caller actions.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Capability string gating one category of action.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Scope {
    /// Prompt a language model.
    ModelPrompt,
    /// Run the tool-calling agent loop.
    ModelTools,
    /// Enumerate available language models.
    ModelList,
    /// Enumerate tools exposed by running servers.
    ToolsList,
    /// Invoke a tool on a running server.
    ToolsCall,
    /// Install a new tool server.
    ServersRegister,
    /// Read content from the caller's active tab.
    ActiveTabRead,
    /// Open the host chat surface.
    ChatOpen,
    /// Fetch arbitrary network resources through the host.
    WebFetch,
}

impl Scope {
    /// Every known scope, in declaration order.
    pub const ALL: [Scope; 9] = [
        Scope::ModelPrompt,
        Scope::ModelTools,
        Scope::ModelList,
        Scope::ToolsList,
        Scope::ToolsCall,
        Scope::ServersRegister,
        Scope::ActiveTabRead,
        Scope::ChatOpen,
        Scope::WebFetch,
    ];

    /// Returns the wire representation of the scope.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ModelPrompt => "model:prompt",
            Self::ModelTools => "model:tools",
            Self::ModelList => "model:list",
            Self::ToolsList => "mcp:tools.list",
            Self::ToolsCall => "mcp:tools.call",
            Self::ServersRegister => "mcp:servers.register",
            Self::ActiveTabRead => "browser:activeTab.read",
            Self::ChatOpen => "chat:open",
            Self::WebFetch => "web:fetch",
        }
    }
}

impl Display for Scope {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|scope| scope.as_str() == s)
            .ok_or_else(|| Error::UnknownScope(s.to_owned()))
    }
}

impl TryFrom<String> for Scope {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Scope> for String {
    fn from(value: Scope) -> Self {
        value.as_str().to_owned()
    }
}
