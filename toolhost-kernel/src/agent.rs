//! Bounded tool-calling agent loop.
//!
//! A run moves through [`RunState::Thinking`], optionally
//! [`RunState::AwaitingToolResult`] and [`RunState::Summarizing`], and ends in
//! [`RunState::Done`]. The first successful tool result always leads to a
//! single tool-less summarisation call, so a run performs at most one
//! successful tool round-trip even when the ceiling allows more calls.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use serde_json::Value;
use toolhost_adapters::{ChatMessage, ChatModel, ChatRequest, ChatResponse, ToolCall, ToolSpec};
use toolhost_primitives::ToolKey;
use tracing::{debug, info, warn};

use crate::gateway::{CallContext, ToolCallResult, ToolGateway, content_text};
use crate::registry::RunningTool;

/// Separator replacing `/` in tool names shown to the model.
pub const TOOL_NAME_SEPARATOR: &str = "__";

/// Default ceiling on tool calls per run.
pub const DEFAULT_MAX_TOOL_CALLS: usize = 5;

/// Final answer when the ceiling is exhausted without a successful tool call.
pub const FALLBACK_ANSWER: &str =
    "I could not complete this task with the available tools. Please try rephrasing it.";

const SUMMARY_INSTRUCTION: &str =
    "Answer the original task using the tool result above. Do not call any more tools.";

/// Event emitted while a run progresses.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Run started.
    Status {
        /// Human-readable status line.
        message: String,
    },
    /// A tool is about to be invoked.
    ToolCall {
        /// Model-assigned call id.
        id: String,
        /// `serverId/toolName`, or the raw name when it matched no tool.
        tool: String,
        /// Arguments supplied by the model.
        arguments: Value,
    },
    /// A tool invocation finished.
    ToolResult {
        /// Model-assigned call id.
        id: String,
        /// `serverId/toolName`, or the raw name when it matched no tool.
        tool: String,
        /// Gateway outcome.
        result: ToolCallResult,
    },
    /// Final answer.
    Final {
        /// Answer text.
        content: String,
    },
    /// Fatal failure.
    Error {
        /// Failure description.
        message: String,
    },
}

/// Position of a run in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Waiting on the model with tools enabled.
    Thinking,
    /// Executing the tool calls the model asked for.
    AwaitingToolResult,
    /// Waiting on the tool-less answer after a successful tool call.
    Summarizing,
    /// Run finished.
    Done,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentOutcome {
    /// A final answer was produced.
    Completed(String),
    /// The model failed; an error event was emitted.
    Failed(String),
    /// The caller cancelled the run.
    Cancelled,
}

/// Cooperative cancellation flag shared with the caller.
///
/// Cancelling stops further events and iterations. A tool call already in
/// flight runs to completion.
#[derive(Debug, Clone, Default)]
pub struct RunCancellation {
    cancelled: Arc<AtomicBool>,
}

impl RunCancellation {
    /// Creates an untriggered flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Per-run options.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Ceiling on tool calls.
    pub max_tool_calls: usize,
    /// Restricts the exposed tools to these keys.
    pub tools: Option<Vec<ToolKey>>,
    /// Caller identity forwarded with every tool call.
    pub context: Option<CallContext>,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            max_tool_calls: DEFAULT_MAX_TOOL_CALLS,
            tools: None,
            context: None,
        }
    }
}

/// Conversation state of one run.
struct AgentRunState {
    messages: Vec<ChatMessage>,
    tool_call_count: usize,
    max_tool_calls: usize,
    state: RunState,
}

struct Emitter<'a, F> {
    cancel: &'a RunCancellation,
    sink: F,
}

impl<F: FnMut(AgentEvent)> Emitter<'_, F> {
    /// Delivers `event` unless the run was cancelled.
    fn emit(&mut self, event: AgentEvent) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        (self.sink)(event);
        true
    }
}

/// Tools exposed to the model, keyed by their model-safe name.
struct ExposedTools {
    specs: Vec<ToolSpec>,
    by_name: HashMap<String, ToolKey>,
}

impl ExposedTools {
    fn new(tools: Vec<RunningTool>) -> Self {
        let mut specs = Vec::with_capacity(tools.len());
        let mut by_name = HashMap::with_capacity(tools.len());
        for tool in tools {
            let name = exposed_name(&tool.key);
            if by_name.contains_key(&name) {
                warn!(tool = %tool.key, name, "tool name collides after sanitising, skipping");
                continue;
            }
            specs.push(ToolSpec::new(
                name.clone(),
                tool.definition.description.clone(),
                tool.definition.input_schema.clone(),
            ));
            by_name.insert(name, tool.key);
        }
        Self { specs, by_name }
    }

    fn system_prompt(&self) -> String {
        if self.specs.is_empty() {
            return "You are a helpful assistant. No tools are available, so answer directly."
                .to_owned();
        }
        let mut prompt = String::from(
            "You are a helpful assistant that can call tools. Call a tool only when it helps \
             answer the task.\nAvailable tools:\n",
        );
        for spec in &self.specs {
            prompt.push_str("- ");
            prompt.push_str(&spec.name);
            if let Some(description) = &spec.description {
                prompt.push_str(": ");
                prompt.push_str(description);
            }
            prompt.push('\n');
        }
        prompt
    }
}

/// Rewrites `serverId/toolName` into a name chat APIs accept.
#[must_use]
pub fn exposed_name(key: &ToolKey) -> String {
    format!("{}{TOOL_NAME_SEPARATOR}{}", key.server_id(), key.tool())
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Drives runs over a chat model and the tool gateway.
pub struct AgentRunner {
    model: Arc<dyn ChatModel>,
    gateway: Arc<ToolGateway>,
}

impl fmt::Debug for AgentRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let metadata = self.model.metadata();
        f.debug_struct("AgentRunner")
            .field("provider", &metadata.provider())
            .field("model", &metadata.model())
            .finish_non_exhaustive()
    }
}

impl AgentRunner {
    /// Creates a runner.
    #[must_use]
    pub fn new(model: Arc<dyn ChatModel>, gateway: Arc<ToolGateway>) -> Self {
        Self { model, gateway }
    }

    /// Runs `task`, delivering events to `on_event` as they happen.
    pub async fn run<F>(
        &self,
        task: &str,
        options: &AgentOptions,
        cancel: &RunCancellation,
        on_event: F,
    ) -> AgentOutcome
    where
        F: FnMut(AgentEvent) + Send,
    {
        let mut events = Emitter {
            cancel,
            sink: on_event,
        };
        let tools = ExposedTools::new(
            self.gateway
                .registry()
                .running_tools(options.tools.as_deref()),
        );
        let mut run = AgentRunState {
            messages: vec![
                ChatMessage::system(tools.system_prompt()),
                ChatMessage::user(task),
            ],
            tool_call_count: 0,
            max_tool_calls: options.max_tool_calls,
            state: RunState::Thinking,
        };

        info!(
            model = %self.model.metadata().model(),
            tools = tools.specs.len(),
            max_tool_calls = run.max_tool_calls,
            "agent run started"
        );
        if !events.emit(AgentEvent::Status {
            message: format!("Working on the task with {} tool(s)", tools.specs.len()),
        }) {
            return AgentOutcome::Cancelled;
        }

        let mut pending: Option<ChatResponse> = None;
        let mut outcome = AgentOutcome::Cancelled;
        while run.state != RunState::Done {
            if cancel.is_cancelled() {
                debug!(state = ?run.state, "agent run cancelled");
                return AgentOutcome::Cancelled;
            }
            run.state = match run.state {
                RunState::Thinking => {
                    match self.complete(&run.messages, tools.specs.clone()).await {
                        Ok(response) if response.tool_calls.is_empty() => {
                            outcome = self.finish(&mut events, response.content);
                            RunState::Done
                        }
                        Ok(response) => {
                            pending = Some(response);
                            RunState::AwaitingToolResult
                        }
                        Err(message) => {
                            outcome = fail(&mut events, message);
                            RunState::Done
                        }
                    }
                }
                RunState::AwaitingToolResult => {
                    let response = pending.take().unwrap_or_default();
                    match self
                        .execute_batch(&mut run, &tools, response, options, &mut events)
                        .await
                    {
                        BatchResult::Cancelled => return AgentOutcome::Cancelled,
                        BatchResult::Succeeded => RunState::Summarizing,
                        BatchResult::Failed if run.tool_call_count >= run.max_tool_calls => {
                            info!(calls = run.tool_call_count, "tool call ceiling reached");
                            outcome = self.finish(&mut events, FALLBACK_ANSWER.to_owned());
                            RunState::Done
                        }
                        BatchResult::Failed => RunState::Thinking,
                    }
                }
                RunState::Summarizing => {
                    run.messages.push(ChatMessage::user(SUMMARY_INSTRUCTION));
                    outcome = match self.complete(&run.messages, Vec::new()).await {
                        Ok(response) => self.finish(&mut events, response.content),
                        Err(message) => fail(&mut events, message),
                    };
                    RunState::Done
                }
                RunState::Done => RunState::Done,
            };
        }
        outcome
    }

    /// Runs `task` and returns every event it produced.
    pub async fn run_collect(&self, task: &str, options: &AgentOptions) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        self.run(task, options, &RunCancellation::new(), |event| {
            events.push(event);
        })
        .await;
        events
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: Vec<ToolSpec>,
    ) -> Result<ChatResponse, String> {
        let request = ChatRequest::new(messages.to_vec())
            .map_err(|err| err.to_string())?
            .with_tools(tools);
        self.model.complete(request).await.map_err(|err| {
            let metadata = self.model.metadata();
            format!(
                "model `{}` ({}) failed: {err}",
                metadata.model(),
                metadata.provider()
            )
        })
    }

    fn finish<F: FnMut(AgentEvent)>(
        &self,
        events: &mut Emitter<'_, F>,
        content: String,
    ) -> AgentOutcome {
        if !events.emit(AgentEvent::Final {
            content: content.clone(),
        }) {
            return AgentOutcome::Cancelled;
        }
        info!(model = %self.model.metadata().model(), "agent run finished");
        AgentOutcome::Completed(content)
    }

    async fn execute_batch<F: FnMut(AgentEvent)>(
        &self,
        run: &mut AgentRunState,
        tools: &ExposedTools,
        response: ChatResponse,
        options: &AgentOptions,
        events: &mut Emitter<'_, F>,
    ) -> BatchResult {
        let mut answered: Vec<ToolCall> = Vec::new();
        let mut results: Vec<ChatMessage> = Vec::new();
        let mut outcome = BatchResult::Failed;

        for call in response.tool_calls {
            if run.tool_call_count >= run.max_tool_calls {
                break;
            }
            run.tool_call_count += 1;

            let key = tools.by_name.get(&call.name);
            let label = key.map_or_else(|| call.name.clone(), ToString::to_string);
            if !events.emit(AgentEvent::ToolCall {
                id: call.id.clone(),
                tool: label.clone(),
                arguments: call.arguments.clone(),
            }) {
                return BatchResult::Cancelled;
            }

            let result = match key {
                Some(key) => {
                    self.gateway
                        .call_tool(
                            key.server_id().as_str(),
                            key.tool(),
                            call.arguments.clone(),
                            options.context.as_ref(),
                        )
                        .await
                }
                None => ToolCallResult::failure(format!("unknown tool `{}`", call.name)),
            };
            debug!(tool = %label, ok = result.ok, call = run.tool_call_count, "tool step finished");

            results.push(ChatMessage::tool(call.id.clone(), result_text(&result)));
            let succeeded = result.ok;
            answered.push(call.clone());
            if !events.emit(AgentEvent::ToolResult {
                id: call.id,
                tool: label,
                result,
            }) {
                return BatchResult::Cancelled;
            }
            if succeeded {
                outcome = BatchResult::Succeeded;
                break;
            }
        }

        // Only calls that got a result stay in history.
        run.messages
            .push(ChatMessage::assistant(response.content, answered));
        run.messages.extend(results);
        outcome
    }
}

enum BatchResult {
    Succeeded,
    Failed,
    Cancelled,
}

fn fail<F: FnMut(AgentEvent)>(events: &mut Emitter<'_, F>, message: String) -> AgentOutcome {
    warn!(error = %message, "agent run failed");
    if !events.emit(AgentEvent::Error {
        message: message.clone(),
    }) {
        return AgentOutcome::Cancelled;
    }
    AgentOutcome::Failed(message)
}

fn result_text(result: &ToolCallResult) -> String {
    match (&result.result, &result.error) {
        (Some(value), _) if result.ok => content_text(value).unwrap_or_else(|| value.to_string()),
        (_, Some(error)) => format!("Error: {error}"),
        _ => "Error: tool call failed".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use toolhost_primitives::ServerId;

    #[test]
    fn exposed_names_are_model_safe() {
        let key = ToolKey::new(ServerId::new("acme.weather").unwrap(), "get forecast");
        assert_eq!(exposed_name(&key), "acme_weather__get_forecast");
    }

    #[test]
    fn result_text_prefers_text_content() {
        let ok = ToolCallResult::success(json!({ "content": [{ "type": "text", "text": "4" }] }));
        assert_eq!(result_text(&ok), "4");
        let raw = ToolCallResult::success(json!({ "value": 4 }));
        assert_eq!(result_text(&raw), "{\"value\":4}");
        assert_eq!(result_text(&ToolCallResult::failure("boom")), "Error: boom");
    }

    #[test]
    fn cancellation_is_shared() {
        let cancel = RunCancellation::new();
        let clone = cancel.clone();
        clone.cancel();
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn events_serialize_with_type_tags() {
        let event = AgentEvent::ToolCall {
            id: "call_1".into(),
            tool: "builtin-echo/echo".into(),
            arguments: json!({}),
        };
        assert_eq!(serde_json::to_value(&event).unwrap()["type"], "tool_call");
    }
}
