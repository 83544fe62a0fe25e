//! Identifier types for servers, origins, and tools.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const MAX_ID_LEN: usize = 64;

/// Separator between server id and tool name in user-facing tool keys.
pub const TOOL_KEY_SEPARATOR: char = '/';

/// Unique identifier of an installed tool server.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerId(String);

impl ServerId {
    /// Creates a new server identifier after validating its format.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidServerId`] if the identifier is empty, too long,
    /// or contains unsupported characters.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_server_id(&id)?;
        Ok(Self(id))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ServerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ServerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for ServerId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ServerId> for String {
    fn from(value: ServerId) -> Self {
        value.0
    }
}

fn validate_server_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidServerId {
            id: String::new(),
            reason: "identifier cannot be empty".into(),
        });
    }

    if id.len() > MAX_ID_LEN {
        return Err(Error::InvalidServerId {
            id: id.into(),
            reason: format!("identifier length must be <= {MAX_ID_LEN}"),
        });
    }

    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '@'))
    {
        return Err(Error::InvalidServerId {
            id: id.into(),
            reason: "identifier must contain alphanumeric, dash, dot, or at-sign".into(),
        });
    }

    Ok(())
}

/// Scheme, host, and port identity of a caller; the unit of permission isolation.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Origin(String);

impl Origin {
    /// Parses an origin, normalising the scheme and host to lowercase and
    /// stripping any path component.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOrigin`] when the string lacks a scheme or host.
    pub fn parse(raw: impl AsRef<str>) -> Result<Self> {
        let raw = raw.as_ref().trim();
        let invalid = |reason: &str| Error::InvalidOrigin {
            origin: raw.to_owned(),
            reason: reason.to_owned(),
        };

        let (scheme, rest) = raw
            .split_once("://")
            .ok_or_else(|| invalid("missing scheme"))?;
        if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(invalid("scheme must be alphanumeric"));
        }

        let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
        if authority.is_empty() {
            return Err(invalid("missing host"));
        }

        Ok(Self(format!(
            "{}://{}",
            scheme.to_ascii_lowercase(),
            authority.to_ascii_lowercase()
        )))
    }

    /// Returns the origin as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Origin {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Origin {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Origin {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<Origin> for String {
    fn from(value: Origin) -> Self {
        value.0
    }
}

/// Fully-qualified tool address, `serverId/toolName`.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ToolKey {
    server_id: ServerId,
    tool: String,
}

impl ToolKey {
    /// Creates a tool key from its parts.
    #[must_use]
    pub fn new(server_id: ServerId, tool: impl Into<String>) -> Self {
        Self {
            server_id,
            tool: tool.into(),
        }
    }

    /// Returns the server part.
    #[must_use]
    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    /// Returns the tool name part.
    #[must_use]
    pub fn tool(&self) -> &str {
        &self.tool
    }
}

impl Display for ToolKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}{TOOL_KEY_SEPARATOR}{}", self.server_id, self.tool)
    }
}

impl FromStr for ToolKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (server, tool) = s
            .split_once(TOOL_KEY_SEPARATOR)
            .filter(|(_, tool)| !tool.is_empty())
            .ok_or_else(|| Error::InvalidToolKey(s.to_owned()))?;
        let server_id = ServerId::new(server).map_err(|_| Error::InvalidToolKey(s.to_owned()))?;
        Ok(Self::new(server_id, tool))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_id_rejects_separator() {
        assert!(ServerId::new("weather").is_ok());
        assert!(ServerId::new("acme.weather-v2").is_ok());
        assert!(ServerId::new("bad/id").is_err());
        assert!(ServerId::new("").is_err());
    }

    #[test]
    fn origin_is_normalised() {
        let origin = Origin::parse("HTTPS://Example.com:8443/some/path?q=1").unwrap();
        assert_eq!(origin.as_str(), "https://example.com:8443");
        assert!(Origin::parse("example.com").is_err());
        assert!(Origin::parse("https://").is_err());
    }

    #[test]
    fn tool_key_parses_first_separator() {
        let key: ToolKey = "files/read/deep".parse().unwrap();
        assert_eq!(key.server_id().as_str(), "files");
        assert_eq!(key.tool(), "read/deep");
        assert_eq!(key.to_string(), "files/read/deep");
        assert!("files/".parse::<ToolKey>().is_err());
    }
}
