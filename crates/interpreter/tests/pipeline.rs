//! Cancellation, durability and event publishing across a whole script run.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use taskforge_config::InterpreterConfig;
use taskforge_core::error::{InterpreterError, ToolError};
use taskforge_core::event::TaskEvent;
use taskforge_core::hub::EventHub;
use taskforge_core::session::Session;
use taskforge_core::task::TaskId;
use taskforge_core::tool::{HostTool, ToolRegistry};
use taskforge_interpreter::{Interpreter, Invocation};
use taskforge_store::InMemoryStore;
use tokio_util::sync::CancellationToken;

struct Sleeper {
    name: &'static str,
    delay: Duration,
    durable: bool,
    finished: Arc<AtomicBool>,
}

impl Sleeper {
    fn new(name: &'static str, delay_ms: u64, durable: bool) -> Self {
        Self {
            name,
            delay: Duration::from_millis(delay_ms),
            durable,
            finished: Arc::default(),
        }
    }
}

#[async_trait]
impl HostTool for Sleeper {
    fn name(&self) -> &str {
        self.name
    }
    fn description(&self) -> &str {
        "sleeps"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }
    fn is_durable(&self) -> bool {
        self.durable
    }
    async fn call(
        &self,
        _session: &Session,
        _input: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        tokio::time::sleep(self.delay).await;
        self.finished.store(true, Ordering::SeqCst);
        Ok(serde_json::json!({"slept_ms": self.delay.as_millis() as u64}))
    }
}

fn hub() -> Arc<EventHub> {
    Arc::new(EventHub::new(Arc::new(InMemoryStore::new()), 16))
}

fn cancel_after(token: &CancellationToken, ms: u64) {
    let token = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        token.cancel();
    });
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_returns_promptly_with_partial_calls() {
    let tools = ToolRegistry::new()
        .with(Arc::new(Sleeper::new("quick", 1, false)))
        .with(Arc::new(Sleeper::new("slow", 30_000, false)));
    let interpreter = Interpreter::new(tools, InterpreterConfig::default())
        .with_default_interceptors(hub());
    let cancel = CancellationToken::new();
    let invocation = Invocation::new(TaskId::from("t"), "/tmp", cancel.clone());

    cancel_after(&cancel, 100);
    let started = Instant::now();
    let outcome = interpreter.execute(&invocation, "quick(); slow(); quick();").await;

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(outcome.error, Some(InterpreterError::Cancelled));
    let tools: Vec<&str> = outcome.function_calls.iter().map(|c| c.tool.as_str()).collect();
    assert_eq!(tools, vec!["quick", "slow"]);
    assert!(outcome.function_calls[1].error.is_some());
    assert_eq!(outcome.tool_uses["quick"], 1);
    assert!(!outcome.durable);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_interrupts_pure_computation() {
    let interpreter = Interpreter::new(ToolRegistry::new(), InterpreterConfig::default());
    let cancel = CancellationToken::new();
    let invocation = Invocation::new(TaskId::from("t"), "/tmp", cancel.clone());

    cancel_after(&cancel, 50);
    let started = Instant::now();
    let outcome = interpreter
        .execute(&invocation, "let x = 0; loop { x += 1; }")
        .await;

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(outcome.error_message().as_deref(), Some("execution was cancelled"));
}

#[tokio::test(flavor = "multi_thread")]
async fn durable_call_finishes_before_cancel_takes_effect() {
    let commit = Sleeper::new("commit", 300, true);
    let finished = commit.finished.clone();
    let after = Sleeper::new("after", 1, false);
    let after_ran = after.finished.clone();
    let tools = ToolRegistry::new()
        .with(Arc::new(commit))
        .with(Arc::new(after));
    let interpreter = Interpreter::new(tools, InterpreterConfig::default())
        .with_default_interceptors(hub());
    let cancel = CancellationToken::new();
    let invocation = Invocation::new(TaskId::from("t"), "/tmp", cancel.clone());

    cancel_after(&cancel, 50);
    let outcome = interpreter.execute(&invocation, "commit(); after();").await;

    assert!(finished.load(Ordering::SeqCst));
    assert!(!after_ran.load(Ordering::SeqCst));
    assert!(outcome.durable);
    assert_eq!(outcome.error, Some(InterpreterError::Cancelled));
    assert_eq!(outcome.function_calls[0].tool, "commit");
    assert!(outcome.function_calls[0].error.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn runaway_script_times_out() {
    let limits = InterpreterConfig {
        timeout_secs: 1,
        max_operations: 0,
        ..InterpreterConfig::default()
    };
    let interpreter = Interpreter::new(ToolRegistry::new(), limits);
    let invocation = Invocation::new(TaskId::from("t"), "/tmp", CancellationToken::new());

    let outcome = interpreter.execute(&invocation, "loop {}").await;
    assert_eq!(outcome.error, Some(InterpreterError::TimedOut(1)));
}

#[tokio::test(flavor = "multi_thread")]
async fn operation_limit_stops_scripts() {
    let limits = InterpreterConfig {
        max_operations: 1_000,
        ..InterpreterConfig::default()
    };
    let interpreter = Interpreter::new(ToolRegistry::new(), limits);
    let invocation = Invocation::new(TaskId::from("t"), "/tmp", CancellationToken::new());

    let outcome = interpreter.execute(&invocation, "loop {}").await;
    let message = outcome.error_message().unwrap();
    assert!(message.contains("operations"), "{message}");
}

#[tokio::test(flavor = "multi_thread")]
async fn tool_calls_are_published_to_subscribers() {
    let hub = hub();
    let task_id = TaskId::from("observed");
    let mut subscription = hub
        .subscribe(&task_id, CancellationToken::new())
        .await
        .unwrap();

    let tools = ToolRegistry::new().with(Arc::new(Sleeper::new("quick", 1, false)));
    let interpreter =
        Interpreter::new(tools, InterpreterConfig::default()).with_default_interceptors(hub);
    let invocation = Invocation::new(task_id, "/tmp", CancellationToken::new());
    let outcome = interpreter
        .execute(&invocation, r#"quick(#{ reason: "test" })"#)
        .await;
    assert!(outcome.is_ok());

    match subscription.next().await {
        Some(TaskEvent::ToolCall { tool, input }) => {
            assert_eq!(tool, "quick");
            assert_eq!(input["reason"], "test");
        }
        other => panic!("expected tool call, got {other:?}"),
    }
    match subscription.next().await {
        Some(TaskEvent::ToolResult { tool, output, error }) => {
            assert_eq!(tool, "quick");
            assert_eq!(output["slept_ms"], 1);
            assert!(error.is_none());
        }
        other => panic!("expected tool result, got {other:?}"),
    }
}

#[test]
fn default_chain_order() {
    let interpreter = Interpreter::new(ToolRegistry::new(), InterpreterConfig::default())
        .with_default_interceptors(hub());
    assert_eq!(
        interpreter.interceptor_names(),
        vec!["statistics", "durable_function", "event_publisher", "scratch_reset"]
    );
}
