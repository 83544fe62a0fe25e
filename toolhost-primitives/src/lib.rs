//! Core shared types for the toolhost runtime.

#![warn(missing_docs, clippy::pedantic)]

mod error;
mod ids;
mod manifest;
mod scope;

/// Error type and result alias shared across the workspace.
pub use error::{Error, Result};
/// Server, origin, and tool identifiers.
pub use ids::{Origin, ServerId, TOOL_KEY_SEPARATOR, ToolKey};
/// Tool server manifests and their declarations.
pub use manifest::{
    Capabilities, FilesystemCapability, NetworkCapability, OAuthRequirement, RemoteTransportKind,
    RuntimeKind, SecretDeclaration, ServerManifest, ServerManifestBuilder, ToolDefinition,
};
/// Capability scopes gating caller actions.
pub use scope::Scope;
