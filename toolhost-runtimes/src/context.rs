//! Host-side inputs shared by every runtime launcher.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use toolhost_primitives::{OAuthRequirement, ServerId, ServerManifest};
use toolhost_transport::HostRequestHandler;

use crate::{RuntimeError, RuntimeResult};

/// Fuel granted to one wasm request when nothing else is configured.
pub const DEFAULT_FUEL_PER_CALL: u64 = 1_000_000_000;

/// Environment variable carrying the OAuth access token into scripts.
pub const OAUTH_TOKEN_ENV: &str = "TOOLHOST_OAUTH_TOKEN";

/// OAuth access token handed to script runtimes.
#[derive(Clone, PartialEq, Eq)]
pub struct OAuthToken {
    /// Bearer token value.
    pub access_token: String,
    /// Expiry instant, if known.
    pub expires_at: Option<DateTime<Utc>>,
}

impl OAuthToken {
    /// Returns `true` when the token is past its expiry at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

impl fmt::Debug for OAuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthToken")
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Supplies OAuth tokens obtained through a consent flow elsewhere.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Returns the cached token for `provider` covering `scopes`, if any.
    async fn token(&self, provider: &str, scopes: &[String]) -> Option<OAuthToken>;
}

/// Supplies secret values declared by manifests.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    /// Returns the secret `name` for `server`, if configured.
    async fn secret(&self, server: &ServerId, name: &str) -> Option<String>;
}

/// [`SecretProvider`] backed by a fixed map keyed by secret name.
#[derive(Default, Clone)]
pub struct StaticSecrets {
    values: HashMap<String, String>,
}

impl StaticSecrets {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a secret.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }
}

impl fmt::Debug for StaticSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticSecrets")
            .field("names", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl SecretProvider for StaticSecrets {
    async fn secret(&self, _server: &ServerId, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }
}

/// Native script runtime invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptSettings {
    /// Executable, e.g. `deno`. `None` disables the native runtime.
    pub command: Option<String>,
    /// Arguments placed before the permission flags, e.g. `["run", "--quiet"]`.
    pub args: Vec<String>,
}

impl Default for ScriptSettings {
    fn default() -> Self {
        Self {
            command: None,
            args: vec!["run".to_owned(), "--quiet".to_owned()],
        }
    }
}

/// Everything a launcher needs beyond the manifest.
#[derive(Clone)]
pub struct RuntimeContext {
    /// Native script runtime settings.
    pub script: ScriptSettings,
    /// Fuel granted to each wasm request.
    pub fuel_per_call: u64,
    /// Deadline for establishing remote channels.
    pub connect_timeout: Duration,
    /// OAuth token source.
    pub tokens: Option<Arc<dyn TokenProvider>>,
    /// Secret source.
    pub secrets: Option<Arc<dyn SecretProvider>>,
    /// Handler for requests sandboxes send back to the host.
    pub host: Option<Arc<dyn HostRequestHandler>>,
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self {
            script: ScriptSettings::default(),
            fuel_per_call: DEFAULT_FUEL_PER_CALL,
            connect_timeout: Duration::from_secs(10),
            tokens: None,
            secrets: None,
            host: None,
        }
    }
}

impl fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("script", &self.script)
            .field("fuel_per_call", &self.fuel_per_call)
            .field("connect_timeout", &self.connect_timeout)
            .field("tokens", &self.tokens.is_some())
            .field("secrets", &self.secrets.is_some())
            .field("host", &self.host.is_some())
            .finish()
    }
}

impl RuntimeContext {
    /// Resolves the OAuth token the manifest requires, failing closed when it
    /// is missing or expired.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::AuthRequired`] when no usable token exists.
    pub async fn require_token(
        &self,
        requirement: &OAuthRequirement,
        now: DateTime<Utc>,
    ) -> RuntimeResult<OAuthToken> {
        let token = match &self.tokens {
            Some(tokens) => tokens.token(&requirement.provider, &requirement.scopes).await,
            None => None,
        };
        match token {
            Some(token) if !token.is_expired(now) => Ok(token),
            Some(_) => Err(RuntimeError::AuthRequired {
                provider: requirement.provider.clone(),
                reason: "token expired".into(),
            }),
            None => Err(RuntimeError::AuthRequired {
                provider: requirement.provider.clone(),
                reason: "no token available".into(),
            }),
        }
    }

    /// Collects the environment injected into a script: declared secrets and
    /// the OAuth token.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::MissingSecret`] for an absent required secret
    /// and [`RuntimeError::AuthRequired`] for a missing or expired token.
    pub async fn script_environment(
        &self,
        manifest: &ServerManifest,
    ) -> RuntimeResult<HashMap<String, String>> {
        let mut env = HashMap::new();
        for declared in manifest.secrets() {
            let value = match &self.secrets {
                Some(secrets) => secrets.secret(manifest.id(), &declared.name).await,
                None => None,
            };
            match value {
                Some(value) => {
                    env.insert(declared.name.clone(), value);
                }
                None if declared.required => {
                    return Err(RuntimeError::MissingSecret {
                        name: declared.name.clone(),
                    });
                }
                None => {}
            }
        }

        if let Some(requirement) = manifest.oauth() {
            let token = self.require_token(requirement, Utc::now()).await?;
            env.insert(OAUTH_TOKEN_ENV.to_owned(), token.access_token);
        }

        Ok(env)
    }
}
