//! Tracing subscriber setup shared by toolhost binaries.

#![warn(missing_docs, clippy::pedantic)]

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Filter applied when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

/// Errors raised while installing the subscriber.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The fallback filter directive did not parse.
    #[error("invalid log filter `{filter}`: {reason}")]
    InvalidFilter {
        /// Rejected directive.
        filter: String,
        /// Parser message.
        reason: String,
    },
    /// A global subscriber is already installed.
    #[error("tracing subscriber already installed: {0}")]
    AlreadyInstalled(String),
}

/// Output options for [`init_tracing`].
#[derive(Debug, Clone)]
pub struct TracingOptions {
    /// Directive used when `RUST_LOG` is unset.
    pub default_filter: String,
    /// Include the event target in each line.
    pub with_target: bool,
    /// Colourise output.
    pub ansi: bool,
}

impl Default for TracingOptions {
    fn default() -> Self {
        Self {
            default_filter: DEFAULT_FILTER.to_owned(),
            with_target: false,
            ansi: true,
        }
    }
}

impl TracingOptions {
    /// Overrides the fallback filter, e.g. from a `--log-level` flag.
    #[must_use]
    pub fn with_default_filter(mut self, filter: impl Into<String>) -> Self {
        self.default_filter = filter.into();
        self
    }

    fn filter(&self) -> Result<EnvFilter, TelemetryError> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        EnvFilter::try_new(&self.default_filter).map_err(|err| TelemetryError::InvalidFilter {
            filter: self.default_filter.clone(),
            reason: err.to_string(),
        })
    }
}

/// Installs a `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// [`TracingOptions::default_filter`].
///
/// # Errors
///
/// Returns [`TelemetryError`] when the fallback filter is malformed or a
/// global subscriber already exists.
pub fn init_tracing(options: &TracingOptions) -> Result<(), TelemetryError> {
    let filter = options.filter()?;
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(options.with_target)
                .with_thread_ids(false)
                .with_ansi(options.ansi),
        )
        .try_init()
        .map_err(|err| TelemetryError::AlreadyInstalled(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_fallback_filter_is_reported() {
        let options = TracingOptions::default().with_default_filter("toolhost=loud");
        if std::env::var_os("RUST_LOG").is_none() {
            assert!(matches!(
                options.filter(),
                Err(TelemetryError::InvalidFilter { .. })
            ));
        }
    }

    #[test]
    fn second_install_fails() {
        let options = TracingOptions {
            ansi: false,
            ..TracingOptions::default()
        };
        let _ = init_tracing(&options);
        assert!(matches!(
            init_tracing(&options),
            Err(TelemetryError::AlreadyInstalled(_))
        ));
    }
}
