use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};
use toolhost_adapters::{
    AdapterError, AdapterMetadata, AdapterResult, ChatModel, ChatRequest, ChatResponse, ToolCall,
};
use toolhost_kernel::{
    AgentEvent, AgentOptions, AgentOutcome, AgentRunner, FALLBACK_ANSWER, KernelResult, Launcher,
    KernelError, RunCancellation, ServerRegistry, ToolGateway, ToolListObserver, ToolRouter,
};
use toolhost_permissions::{GrantKind, GrantOptions, PermissionEngine};
use toolhost_primitives::{Origin, RuntimeKind, Scope, ServerId, ServerManifest, ToolKey};
use toolhost_runtimes::{Launched, RuntimeContext, RuntimeFlavour, RuntimeResult};
use toolhost_store::MemoryStore;
use toolhost_transport::{
    JsonRpcError, LocalPeer, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST, Transport, spawn_local,
};

struct ScriptedServer {
    list_fails: bool,
}

#[async_trait]
impl LocalPeer for ScriptedServer {
    async fn serve(&self, method: &str, params: Option<Value>) -> Result<Value, JsonRpcError> {
        match method {
            METHOD_TOOLS_LIST if self.list_fails => Err(JsonRpcError::new(-32000, "listing broke")),
            METHOD_TOOLS_LIST => Ok(json!({
                "tools": [
                    { "name": "echo", "description": "Echoes text" },
                    { "name": "fail" }
                ]
            })),
            METHOD_TOOLS_CALL => {
                let params = params.unwrap_or_default();
                match params["name"].as_str() {
                    Some("echo") => Ok(json!({
                        "content": [{ "type": "text", "text": params["arguments"]["text"] }]
                    })),
                    _ => Err(JsonRpcError::new(-32000, "tool exploded")),
                }
            }
            other => Err(JsonRpcError::method_not_found(other)),
        }
    }
}

#[derive(Default)]
struct ScriptedLauncher {
    list_fails: bool,
    launches: AtomicUsize,
}

#[async_trait]
impl Launcher for ScriptedLauncher {
    async fn launch(
        &self,
        manifest: &ServerManifest,
        _ctx: &RuntimeContext,
    ) -> RuntimeResult<Launched> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let transport = spawn_local(
            manifest.id().as_str(),
            Arc::new(ScriptedServer {
                list_fails: self.list_fails,
            }),
        );
        Ok(Launched::new(transport, RuntimeFlavour::Builtin))
    }
}

#[derive(Default)]
struct CountingObserver {
    calls: AtomicUsize,
}

#[async_trait]
impl ToolListObserver for CountingObserver {
    async fn tools_changed(&self, _manifest: &ServerManifest) -> KernelResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct ScriptedModel {
    metadata: AdapterMetadata,
    responses: Mutex<VecDeque<ChatResponse>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedModel {
    fn new(responses: impl IntoIterator<Item = ChatResponse>) -> Arc<Self> {
        Arc::new(Self {
            metadata: AdapterMetadata::new("scripted", "scripted-1"),
            responses: Mutex::new(responses.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn metadata(&self) -> &AdapterMetadata {
        &self.metadata
    }

    async fn complete(&self, request: ChatRequest) -> AdapterResult<ChatResponse> {
        self.requests.lock().unwrap().push(request);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| AdapterError::response("script exhausted"))
    }
}

fn server_id() -> ServerId {
    ServerId::new("scripted").unwrap()
}

fn manifest() -> ServerManifest {
    ServerManifest::builder(server_id())
        .name("Scripted")
        .version("1.0.0")
        .runtime(RuntimeKind::Js)
        .script_source("export {}")
        .build()
        .unwrap()
}

async fn registry_with(
    launcher: Arc<ScriptedLauncher>,
    store: Arc<MemoryStore>,
    observer: Arc<CountingObserver>,
) -> Arc<ServerRegistry> {
    let registry = ServerRegistry::builder(store)
        .launcher(launcher)
        .observer(observer)
        .build()
        .unwrap();
    registry.register_server(manifest()).await.unwrap();
    Arc::new(registry)
}

async fn validated_registry() -> Arc<ServerRegistry> {
    let registry = registry_with(
        Arc::new(ScriptedLauncher::default()),
        Arc::new(MemoryStore::new()),
        Arc::new(CountingObserver::default()),
    )
    .await;
    registry
        .validate_and_start_server(&server_id())
        .await
        .unwrap();
    registry
}

#[tokio::test]
async fn routed_calls_need_a_grant_for_the_tool() {
    let registry = validated_registry().await;
    let permissions = Arc::new(PermissionEngine::with_store(Arc::new(MemoryStore::new())));
    let router = ToolRouter::new(
        Arc::clone(&permissions),
        Arc::new(ToolGateway::new(Arc::clone(&registry))),
    );
    assert!(format!("{router:?}").contains("PermissionEngine"));

    let origin = Origin::parse("https://app.example.com").unwrap();
    let echo = ToolKey::new(server_id(), "echo");
    let err = router
        .call_tool(&origin, &echo, json!({ "text": "hi" }), None)
        .await
        .expect_err("no grant yet");
    assert!(matches!(err, KernelError::PermissionDenied { .. }));

    permissions
        .grant_permissions(
            &origin,
            &[Scope::ToolsCall],
            GrantKind::Always,
            GrantOptions::default().with_allowed_tools(["scripted/echo"]),
        )
        .await
        .unwrap();
    let result = router
        .call_tool(&origin, &echo, json!({ "text": "hi" }), None)
        .await
        .unwrap();
    assert!(result.ok);

    let err = router
        .call_tool(&origin, &ToolKey::new(server_id(), "fail"), json!({}), None)
        .await
        .expect_err("outside allowlist");
    assert!(matches!(err, KernelError::ToolNotAllowed { .. }));
    registry.shutdown().await;
}

fn call(id: &str, name: &str, arguments: Value) -> ToolCall {
    ToolCall::new(id, name, arguments)
}

#[tokio::test]
async fn failed_probe_leaves_no_session() {
    let launcher = Arc::new(ScriptedLauncher {
        list_fails: true,
        ..ScriptedLauncher::default()
    });
    let observer = Arc::new(CountingObserver::default());
    let registry = registry_with(
        Arc::clone(&launcher),
        Arc::new(MemoryStore::new()),
        Arc::clone(&observer),
    )
    .await;

    registry
        .validate_and_start_server(&server_id())
        .await
        .expect_err("probe fails");

    assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    assert!(!registry.is_running(&server_id()));
    let handle = registry.server(&server_id()).unwrap();
    assert!(!handle.manifest().autostart());
    assert!(handle.tools().is_empty());
    assert_eq!(observer.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn validation_persists_tools_and_autostart() {
    let store = Arc::new(MemoryStore::new());
    let observer = Arc::new(CountingObserver::default());
    let registry = registry_with(
        Arc::new(ScriptedLauncher::default()),
        Arc::clone(&store),
        Arc::clone(&observer),
    )
    .await;

    let tools = registry
        .validate_and_start_server(&server_id())
        .await
        .unwrap();
    assert_eq!(tools.len(), 2);
    assert!(registry.is_running(&server_id()));
    assert!(registry.resolve_tool(&server_id(), "echo").is_some());
    assert_eq!(observer.calls.load(Ordering::SeqCst), 1);

    let launcher = Arc::new(ScriptedLauncher::default());
    let reloaded = ServerRegistry::builder(store)
        .launcher(Arc::clone(&launcher) as Arc<dyn Launcher>)
        .build()
        .unwrap();
    assert_eq!(reloaded.load_persisted().await.unwrap(), 1);
    let handle = reloaded.server(&server_id()).unwrap();
    assert!(handle.manifest().autostart());
    assert_eq!(handle.tools().len(), 2);

    assert_eq!(reloaded.start_autostart_servers().await, 1);
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    reloaded.shutdown().await;
    registry.shutdown().await;
}

#[tokio::test]
async fn closed_channel_drops_session() {
    let registry = validated_registry().await;
    let session = registry.session(&server_id()).unwrap();

    session.transport().close().await;
    for _ in 0..50 {
        if !registry.is_running(&server_id()) {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(!registry.is_running(&server_id()));
    assert!(!registry.list_servers()[0].running);

    assert!(registry.start_server(&server_id()).await);
    assert_ne!(registry.session(&server_id()).unwrap().id(), session.id());
}

#[tokio::test]
async fn agent_without_tool_calls_answers_directly() {
    let registry = Arc::new(
        ServerRegistry::builder(Arc::new(MemoryStore::new()))
            .build()
            .unwrap(),
    );
    let model = ScriptedModel::new([ChatResponse::text("Paris.")]);
    let runner = AgentRunner::new(model.clone(), Arc::new(ToolGateway::new(registry)));

    let events = runner
        .run_collect("Capital of France?", &AgentOptions::default())
        .await;

    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], AgentEvent::Status { .. }));
    assert_eq!(
        events[1],
        AgentEvent::Final {
            content: "Paris.".into()
        }
    );
    let requests = model.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].tools().is_empty());
}

#[tokio::test]
async fn first_success_is_summarised_without_another_tool_round() {
    let registry = validated_registry().await;
    let model = ScriptedModel::new([
        ChatResponse::with_tool_calls(vec![
            call("call_1", "scripted__echo", json!({ "text": "42" })),
            call("call_2", "scripted__fail", json!({})),
        ]),
        ChatResponse::text("The answer is 42."),
    ]);
    let runner = AgentRunner::new(model.clone(), Arc::new(ToolGateway::new(registry)));

    let events = runner.run_collect("What is the answer?", &AgentOptions::default()).await;

    assert_eq!(events.len(), 4, "{events:?}");
    assert!(matches!(events[0], AgentEvent::Status { .. }));
    assert!(matches!(&events[1], AgentEvent::ToolCall { tool, .. } if tool == "scripted/echo"));
    match &events[2] {
        AgentEvent::ToolResult { result, .. } => {
            assert!(result.ok);
            assert_eq!(result.result.as_ref().unwrap()["content"][0]["text"], "42");
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(
        events[3],
        AgentEvent::Final {
            content: "The answer is 42.".into()
        }
    );

    let requests = model.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].tools().len(), 2);
    assert!(requests[1].tools().is_empty());
    let assistant_calls: usize = requests[1]
        .messages()
        .iter()
        .map(|message| message.tool_calls().len())
        .sum();
    assert_eq!(assistant_calls, 1);
}

#[tokio::test]
async fn ceiling_without_success_yields_fallback() {
    let registry = validated_registry().await;
    let model = ScriptedModel::new([
        ChatResponse::with_tool_calls(vec![call("call_1", "scripted__fail", json!({}))]),
        ChatResponse::with_tool_calls(vec![
            call("call_2", "scripted__fail", json!({})),
            call("call_3", "scripted__fail", json!({})),
        ]),
    ]);
    let runner = AgentRunner::new(model.clone(), Arc::new(ToolGateway::new(registry)));
    let options = AgentOptions {
        max_tool_calls: 2,
        ..AgentOptions::default()
    };

    let events = runner.run_collect("Break things", &options).await;

    let results: Vec<&AgentEvent> = events
        .iter()
        .filter(|event| matches!(event, AgentEvent::ToolResult { .. }))
        .collect();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(
        |event| matches!(event, AgentEvent::ToolResult { result, .. } if !result.ok)
    ));
    assert_eq!(
        events.last(),
        Some(&AgentEvent::Final {
            content: FALLBACK_ANSWER.into()
        })
    );
    assert_eq!(model.requests().len(), 2);
}

#[tokio::test]
async fn unknown_tool_names_are_reported_to_the_model() {
    let registry = validated_registry().await;
    let model = ScriptedModel::new([
        ChatResponse::with_tool_calls(vec![call("call_1", "nope__missing", json!({}))]),
        ChatResponse::text("I could not find that tool."),
    ]);
    let runner = AgentRunner::new(model.clone(), Arc::new(ToolGateway::new(registry)));

    let events = runner.run_collect("Use a tool", &AgentOptions::default()).await;

    assert!(matches!(
        &events[2],
        AgentEvent::ToolResult { tool, result, .. } if tool == "nope__missing" && !result.ok
    ));
    let requests = model.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].tools().len(), 2);
}

#[tokio::test]
async fn model_failure_ends_the_run() {
    let registry = validated_registry().await;
    let runner = AgentRunner::new(
        ScriptedModel::new([]),
        Arc::new(ToolGateway::new(registry)),
    );

    let mut events = Vec::new();
    let outcome = runner
        .run(
            "Anything",
            &AgentOptions::default(),
            &RunCancellation::new(),
            |event| events.push(event),
        )
        .await;

    assert!(matches!(outcome, AgentOutcome::Failed(_)));
    assert_eq!(events.len(), 2);
    assert!(matches!(events[1], AgentEvent::Error { .. }));
}

#[tokio::test]
async fn cancellation_stops_further_events() {
    let registry = validated_registry().await;
    let model = ScriptedModel::new([ChatResponse::text("never seen")]);
    let runner = AgentRunner::new(model.clone(), Arc::new(ToolGateway::new(registry)));
    let cancel = RunCancellation::new();

    let mut events = Vec::new();
    let outcome = runner
        .run("Anything", &AgentOptions::default(), &cancel, |event| {
            events.push(event);
            cancel.cancel();
        })
        .await;

    assert_eq!(outcome, AgentOutcome::Cancelled);
    assert_eq!(events.len(), 1);
    assert!(model.requests().is_empty());
}
