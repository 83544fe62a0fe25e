//! Permission-gated tool host.
//!
//! Wires the building blocks of the other `toolhost-*` crates into the
//! operations a host exposes:
//!
//! - [`ServerRegistry`] owns manifests, sessions, and the tool index,
//! - [`ToolGateway`] forwards `tools/call` to the server owning a tool,
//! - [`ToolRouter`] checks an origin's grants before listing or calling,
//! - [`AgentRunner`] drives a bounded LLM tool-calling loop,
//! - [`HostBridge`] answers host requests sandboxes make on a caller's behalf.

#![warn(missing_docs, clippy::pedantic)]

mod agent;
mod error;
mod gateway;
mod host_bridge;
mod registry;
mod router;

pub use agent::{
    AgentEvent, AgentOptions, AgentOutcome, AgentRunner, DEFAULT_MAX_TOOL_CALLS, FALLBACK_ANSWER,
    RunCancellation, RunState, TOOL_NAME_SEPARATOR, exposed_name,
};
pub use error::{KernelError, KernelResult};
pub use gateway::{CallContext, ToolCallResult, ToolGateway};
pub use host_bridge::{HostBridge, HostCapabilities};
pub use registry::{
    Launcher, RunningTool, RuntimeLauncher, SERVERS_KEY, ServerHandle, ServerRegistry,
    ServerRegistryBuilder, ServerStatus, Session, Timeouts, ToolIndexEntry, ToolListObserver,
};
pub use router::ToolRouter;
