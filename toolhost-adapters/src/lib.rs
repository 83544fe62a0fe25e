//! Chat model adapters used by the agent loop.
//!
//! [`traits::ChatModel`] is the seam the kernel depends on;
//! [`openai::OpenAiAdapter`] speaks the `OpenAI` chat completions wire format
//! with tool calling, which most hosted and local model servers accept.

#![warn(missing_docs, clippy::pedantic)]

pub mod openai;
pub mod traits;

mod http_client;

pub use openai::{OpenAiAdapter, OpenAiConfig};
pub use traits::{
    AdapterError, AdapterMetadata, AdapterResult, ChatMessage, ChatModel, ChatRequest,
    ChatResponse, MessageRole, ToolCall, ToolSpec,
};
