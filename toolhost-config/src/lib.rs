//! Host configuration loaded from TOML.
//!
//! Every section is optional; absent keys fall back to the defaults below, and
//! a missing file yields [`HostConfig::default`].
//!
//! ```toml
//! [permissions]
//! once_ttl_secs = 600
//!
//! [timeouts]
//! metadata_ms = 5000
//! tool_call_ms = 60000
//! connect_ms = 10000
//!
//! [host]
//! trusted_origin = "https://app.example.com"
//!
//! [agent]
//! max_tool_calls = 5
//! model = "gpt-4o-mini"
//!
//! [script]
//! command = "deno"
//! args = ["run", "--quiet"]
//!
//! [wasm]
//! fuel_per_call = 1000000000
//!
//! [storage]
//! path = "toolhost-state.json"
//! ```

#![warn(missing_docs, clippy::pedantic)]

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use toolhost_primitives::Origin;
use tracing::{debug, info};

/// File name looked up when no explicit path is given.
pub const DEFAULT_CONFIG_FILE: &str = "toolhost.toml";

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File exists but could not be read.
    #[error("failed to read `{}`: {source}", path.display())]
    Read {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// File is not valid TOML for [`HostConfig`].
    #[error("failed to parse `{}`: {source}", path.display())]
    Parse {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Permission engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionsConfig {
    /// Lifetime of once-grants in seconds.
    pub once_ttl_secs: u64,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self { once_ttl_secs: 600 }
    }
}

/// Deadlines applied to server traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    /// Deadline for `tools/list` probes.
    pub metadata_ms: u64,
    /// Deadline for `tools/call`.
    pub tool_call_ms: u64,
    /// Deadline for establishing remote channels.
    pub connect_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            metadata_ms: 5_000,
            tool_call_ms: 60_000,
            connect_ms: 10_000,
        }
    }
}

/// Host environment settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSection {
    /// Only origin allowed to use host capabilities such as tab capture.
    pub trusted_origin: Option<Origin>,
}

/// Agent loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Ceiling on tool calls per run.
    pub max_tool_calls: usize,
    /// Chat model identifier.
    pub model: String,
    /// Override for the chat API base URL.
    pub base_url: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_calls: 5,
            model: "gpt-4o-mini".to_owned(),
            base_url: None,
        }
    }
}

/// Native script runtime settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptConfig {
    /// Interpreter executable; unset disables the native runtime.
    pub command: Option<String>,
    /// Arguments placed before the permission flags.
    pub args: Vec<String>,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: vec!["run".to_owned(), "--quiet".to_owned()],
        }
    }
}

/// Wasm runtime settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WasmConfig {
    /// Fuel granted to each request.
    pub fuel_per_call: u64,
}

impl Default for WasmConfig {
    fn default() -> Self {
        Self {
            fuel_per_call: 1_000_000_000,
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON file holding registered servers and permanent grants.
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("toolhost-state.json"),
        }
    }
}

/// Complete host configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// `[permissions]`
    pub permissions: PermissionsConfig,
    /// `[timeouts]`
    pub timeouts: TimeoutsConfig,
    /// `[host]`
    pub host: HostSection,
    /// `[agent]`
    pub agent: AgentConfig,
    /// `[script]`
    pub script: ScriptConfig,
    /// `[wasm]`
    pub wasm: WasmConfig,
    /// `[storage]`
    pub storage: StorageConfig,
}

impl HostConfig {
    /// Loads and validates `path`. A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read, does not parse, or
    /// holds out-of-range values.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let config = Self::from_toml(&raw).map_err(|err| match err {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        info!(path = %path.display(), "loaded host configuration");
        Ok(config)
    }

    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] or [`ConfigError::Invalid`].
    pub fn from_toml(raw: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects zero durations and an empty model name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending key.
    pub fn validate(&self) -> ConfigResult<()> {
        let checks = [
            (self.permissions.once_ttl_secs, "permissions.once_ttl_secs must be non-zero"),
            (self.timeouts.metadata_ms, "timeouts.metadata_ms must be non-zero"),
            (self.timeouts.tool_call_ms, "timeouts.tool_call_ms must be non-zero"),
            (self.timeouts.connect_ms, "timeouts.connect_ms must be non-zero"),
            (self.wasm.fuel_per_call, "wasm.fuel_per_call must be non-zero"),
        ];
        if let Some((_, reason)) = checks.into_iter().find(|(value, _)| *value == 0) {
            return Err(ConfigError::Invalid(reason));
        }
        if self.agent.model.trim().is_empty() {
            return Err(ConfigError::Invalid("agent.model must not be empty"));
        }
        Ok(())
    }

    /// Once-grant lifetime.
    #[must_use]
    pub fn once_ttl(&self) -> Duration {
        Duration::from_secs(self.permissions.once_ttl_secs)
    }

    /// `tools/list` deadline.
    #[must_use]
    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.metadata_ms)
    }

    /// `tools/call` deadline.
    #[must_use]
    pub fn tool_call_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.tool_call_ms)
    }

    /// Remote connect deadline.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.connect_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = HostConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, HostConfig::default());
        assert_eq!(config.tool_call_timeout(), Duration::from_secs(60));
        assert_eq!(config.once_ttl(), Duration::from_secs(600));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = HostConfig::from_toml(
            r#"
            [timeouts]
            tool_call_ms = 1500

            [host]
            trusted_origin = "https://app.example.com"

            [script]
            command = "deno"
            "#,
        )
        .unwrap();
        assert_eq!(config.tool_call_timeout(), Duration::from_millis(1500));
        assert_eq!(config.metadata_timeout(), Duration::from_secs(5));
        assert_eq!(
            config.host.trusted_origin.as_ref().map(Origin::as_str),
            Some("https://app.example.com")
        );
        assert_eq!(config.script.command.as_deref(), Some("deno"));
        assert_eq!(config.script.args, ["run", "--quiet"]);
        assert_eq!(config.agent.max_tool_calls, 5);
    }

    #[test]
    fn zero_durations_are_rejected() {
        let err = HostConfig::from_toml("[timeouts]\nmetadata_ms = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(reason) if reason.contains("metadata_ms")));
        let err = HostConfig::from_toml("[permissions]\nonce_ttl_secs = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn bad_origin_fails_to_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("toolhost.toml");
        std::fs::write(&path, "[host]\ntrusted_origin = \"not an origin\"\n").unwrap();
        let err = HostConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { path: ref p, .. } if *p == path));
    }
}
