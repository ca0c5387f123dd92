//! End-to-end tests for the assembled taskforge stack.
//!
//! These tests wire the gateway, runtime, interpreter, host tools and
//! in-memory store exactly as `taskforge serve` does, swapping only the
//! provider factory for a scripted model, and drive everything over HTTP.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use taskforge_config::{AppConfig, ToolsConfig};
use taskforge_core::error::ProviderError;
use taskforge_core::{
    ContentBlock, EventBus, EventHub, InvokeOptions, InvokeResponse, Message, Model,
    ModelProvider, ProviderRecord, ProviderResolver, Store, Usage,
};
use taskforge_gateway::{GatewayState, build_router};
use taskforge_interpreter::Interpreter;
use taskforge_reconciler::{Reconciler, Runtime};
use taskforge_security::SecretsManager;
use taskforge_store::InMemoryStore;

// ── Mock Provider ────────────────────────────────────────────────────────

/// A mock provider that returns scripted replies in sequence.
struct ScriptedProvider {
    replies: Mutex<VecDeque<Vec<ContentBlock>>>,
    calls: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedProvider {
    fn new(replies: Vec<Vec<ContentBlock>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "e2e_mock"
    }

    async fn invoke(
        &self,
        _model: &Model,
        _system_prompt: &str,
        history: &[Message],
        _options: InvokeOptions,
    ) -> Result<InvokeResponse, ProviderError> {
        self.calls.lock().unwrap().push(history.to_vec());
        let content = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .expect("ScriptedProvider: no more replies");
        Ok(InvokeResponse {
            content,
            usage: Usage {
                input_tokens: 100,
                output_tokens: 20,
                cache_write_tokens: 0,
                cache_read_tokens: 0,
            },
            model: "mock-model".into(),
            stop_reason: None,
        })
    }
}

/// Resolves every record to the scripted provider, after checking that the
/// gateway sealed the credentials it was given.
struct SealedResolver {
    provider: Arc<ScriptedProvider>,
    secrets: Arc<SecretsManager>,
}

#[async_trait::async_trait]
impl ProviderResolver for SealedResolver {
    async fn resolve(
        &self,
        _model: &Model,
        record: &ProviderRecord,
    ) -> Result<Arc<dyn ModelProvider>, ProviderError> {
        let key = self
            .secrets
            .open(&record.encrypted_credentials)
            .map_err(|e| ProviderError::Credentials(e.to_string()))?;
        assert_eq!(key, "sk-e2e");
        Ok(self.provider.clone())
    }
}

// ── Stack ────────────────────────────────────────────────────────────────

struct Stack {
    router: Router,
    store: Arc<dyn Store>,
    provider: Arc<ScriptedProvider>,
    runtime: Option<Runtime>,
}

impl Stack {
    async fn start(replies: Vec<Vec<ContentBlock>>) -> Self {
        let config = AppConfig::default();
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let secrets = Arc::new(SecretsManager::new("e2e-passphrase"));
        let hub = Arc::new(EventHub::new(store.clone(), 64));
        let bus = Arc::new(EventBus::new(64));
        let provider = Arc::new(ScriptedProvider::new(replies));

        let interpreter = Arc::new(
            Interpreter::new(
                taskforge_tools::default_registry(&ToolsConfig::default()),
                config.interpreter.clone(),
            )
            .with_default_interceptors(hub.clone()),
        );
        let resolver = Arc::new(SealedResolver {
            provider: provider.clone(),
            secrets: secrets.clone(),
        });
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            resolver,
            interpreter,
            hub.clone(),
            config.reconciler.clone(),
        ));
        let mut runtime = Runtime::new(reconciler, bus.clone());
        runtime.start().await.unwrap();

        let router = build_router(Arc::new(GatewayState {
            store: store.clone(),
            secrets,
            bus,
            hub,
        }));

        Self {
            router,
            store,
            provider,
            runtime: Some(runtime),
        }
    }

    async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        let req = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(req).await
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        self.send(req).await
    }

    async fn send(&self, req: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    /// Create provider, model and agent through the API; returns the agent id.
    async fn setup_agent(&self) -> String {
        let (status, provider) = self
            .post(
                "/v1/providers",
                json!({ "kind": "anthropic", "api_key": "sk-e2e" }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, model) = self
            .post(
                "/v1/models",
                json!({ "name": "mock-model", "provider_id": provider["id"] }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, agent) = self
            .post(
                "/v1/agents",
                json!({
                    "name": "coder",
                    "instructions": "You work in {{ working_dir }}.",
                    "model_id": model["id"]
                }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        agent["id"].as_str().unwrap().to_string()
    }

    async fn messages(&self, task_id: &str) -> Vec<Message> {
        let (status, body) = self.get(&format!("/v1/tasks/{task_id}/messages")).await;
        assert_eq!(status, StatusCode::OK);
        serde_json::from_value(body).unwrap()
    }

    async fn wait_for_messages(&self, task_id: &str, count: usize) -> Vec<Message> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let messages = self.messages(task_id).await;
            if messages.len() >= count && messages.iter().all(Message::is_processed) {
                return messages;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "task did not settle: {messages:?}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn stop(mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown().await;
        }
    }
}

fn text(s: &str) -> Vec<ContentBlock> {
    vec![ContentBlock::text(s)]
}

// ── Scenarios ────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn task_created_over_http_runs_to_a_final_answer() {
    let stack = Stack::start(vec![text("Hello from the model.")]).await;
    let agent_id = stack.setup_agent().await;
    let dir = tempfile::tempdir().unwrap();

    let (status, task) = stack
        .post(
            "/v1/tasks",
            json!({
                "agent_id": agent_id,
                "project_dir": dir.path(),
                "title": "greeting",
                "message": "Say hello"
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let task_id = task["id"].as_str().unwrap().to_string();

    let messages = stack.wait_for_messages(&task_id, 2).await;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].text(), "Hello from the model.");
    assert!(messages[1].is_final_response);

    let (_, task) = stack.get(&format!("/v1/tasks/{task_id}")).await;
    assert_eq!(task["title"], "greeting");
    assert_eq!(task["usage"]["input_tokens"], 100);

    stack.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn scripts_write_inside_the_project_dir() {
    let script = r#"write_file(#{ path: "notes.txt", content: "from a script" });"#;
    let stack = Stack::start(vec![
        vec![ContentBlock::tool_call("c1", "run_script", json!({ "script": script }))],
        text("Wrote notes.txt"),
    ])
    .await;
    let agent_id = stack.setup_agent().await;
    let dir = tempfile::tempdir().unwrap();

    let (_, task) = stack
        .post(
            "/v1/tasks",
            json!({
                "agent_id": agent_id,
                "project_dir": dir.path(),
                "title": "notes",
                "message": "Write some notes"
            }),
        )
        .await;
    let task_id = task["id"].as_str().unwrap().to_string();

    // user, assistant(call), system(result), assistant(final)
    let messages = stack.wait_for_messages(&task_id, 4).await;
    assert_eq!(messages.len(), 4);
    assert!(matches!(
        messages[2].content[0],
        ContentBlock::CodeInterpreterResult { .. }
    ));
    assert_eq!(
        std::fs::read_to_string(dir.path().join("notes.txt")).unwrap(),
        "from a script"
    );

    let (_, task) = stack.get(&format!("/v1/tasks/{task_id}")).await;
    assert_eq!(task["tool_uses"]["write_file"], 1);
    assert_eq!(stack.provider.calls(), 2);

    stack.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn follow_up_messages_start_a_new_round() {
    let stack = Stack::start(vec![text("first"), text("second")]).await;
    let agent_id = stack.setup_agent().await;
    let dir = tempfile::tempdir().unwrap();

    let (_, task) = stack
        .post(
            "/v1/tasks",
            json!({
                "agent_id": agent_id,
                "project_dir": dir.path(),
                "title": "chat",
                "message": "one"
            }),
        )
        .await;
    let task_id = task["id"].as_str().unwrap().to_string();
    stack.wait_for_messages(&task_id, 2).await;

    let (status, _) = stack
        .post(
            &format!("/v1/tasks/{task_id}/messages"),
            json!({ "content": "two" }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let messages = stack.wait_for_messages(&task_id, 4).await;
    assert_eq!(messages[3].text(), "second");
    assert_eq!(stack.provider.calls(), 2);

    stack.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn suspended_tasks_wait_until_resumed() {
    let stack = Stack::start(vec![text("resumed")]).await;
    let agent_id = stack.setup_agent().await;
    let dir = tempfile::tempdir().unwrap();

    let (_, task) = stack
        .post(
            "/v1/tasks",
            json!({ "agent_id": agent_id, "project_dir": dir.path(), "title": "s" }),
        )
        .await;
    let task_id = task["id"].as_str().unwrap().to_string();

    let (status, _) = stack
        .post(&format!("/v1/tasks/{task_id}/suspend"), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    stack
        .post(
            &format!("/v1/tasks/{task_id}/messages"),
            json!({ "content": "are you there?" }),
        )
        .await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(stack.provider.calls(), 0);
    let pending = stack.store.list_pending_tasks().await.unwrap();
    assert_eq!(pending.len(), 1);

    let (status, _) = stack
        .post(&format!("/v1/tasks/{task_id}/resume"), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);

    let messages = stack.wait_for_messages(&task_id, 2).await;
    assert_eq!(messages[1].text(), "resumed");

    stack.stop().await;
}
