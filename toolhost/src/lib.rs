//! Permission-gated tool host facade.
//!
//! Bundles the `toolhost-*` crates behind feature flags so embedders can pull
//! in only the layers they need.

#![warn(missing_docs, clippy::pedantic)]

/// Identifiers, scopes, and manifests.
pub use toolhost_primitives as primitives;

/// Registry, gateway, router, and agent loop (enabled by `kernel` feature).
#[cfg(feature = "kernel")]
pub use toolhost_kernel as kernel;

/// Chat model adapters (enabled by `adapters` feature).
#[cfg(feature = "adapters")]
pub use toolhost_adapters as adapters;

/// Origin grants (enabled by `permissions` feature).
#[cfg(feature = "permissions")]
pub use toolhost_permissions as permissions;

/// Wasm, script, and remote runtimes (enabled by `runtimes` feature).
#[cfg(feature = "runtimes")]
pub use toolhost_runtimes as runtimes;

/// Key-value persistence (enabled by `store` feature).
#[cfg(feature = "store")]
pub use toolhost_store as store;

/// JSON-RPC transport (enabled by `transport` feature).
#[cfg(feature = "transport")]
pub use toolhost_transport as transport;

/// Tracing setup (enabled by `telemetry` feature).
#[cfg(feature = "telemetry")]
pub use toolhost_telemetry as telemetry;

/// TOML host configuration (enabled by `config` feature).
#[cfg(feature = "config")]
pub use toolhost_config as config;
