//! The script interpreter and its single-call path for native tool calls.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use taskforge_config::InterpreterConfig;
use taskforge_core::error::{InterpreterError, ToolError};
use taskforge_core::hub::EventHub;
use taskforge_core::message::CODE_INTERPRETER_TOOL;
use taskforge_core::provider::ToolDefinition;
use taskforge_core::session::{FunctionCallRecord, Session};
use taskforge_core::task::TaskId;
use taskforge_core::tool::{HostTool, ToolRegistry};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::interceptor::{Interceptor, ToolHandler, wrap};
use crate::interceptors::{
    DURABLE_CALL_KEY, DURABLE_SCRIPT_KEY, DurableFunction, EventPublisher, ScratchReset,
    Statistics, TOOL_USES_KEY,
};
use crate::sandbox::{self, CANCELLED, Console, StopFlag};

/// Who is running, where, and how to stop it.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub task_id: TaskId,
    /// Sandbox root handed to every tool
    pub root: PathBuf,
    pub cancel: CancellationToken,
}

impl Invocation {
    pub fn new(task_id: TaskId, root: impl Into<PathBuf>, cancel: CancellationToken) -> Self {
        Self {
            task_id,
            root: root.into(),
            cancel,
        }
    }
}

/// Everything one run produced, including partial evidence on failure.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    pub output: serde_json::Value,
    pub console: String,
    pub function_calls: Vec<FunctionCallRecord>,
    pub tool_uses: BTreeMap<String, u64>,
    /// A durable tool ran during this execution
    pub durable: bool,
    pub error: Option<InterpreterError>,
}

impl ExecutionOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }

    fn collect(
        session: &Session,
        console: String,
        result: Result<serde_json::Value, InterpreterError>,
    ) -> Self {
        let (output, error) = match result {
            Ok(output) => (output, None),
            Err(e) => (serde_json::Value::Null, Some(e)),
        };
        Self {
            output,
            console,
            function_calls: session.function_calls(),
            tool_uses: session.get(TOOL_USES_KEY).unwrap_or_default(),
            durable: session.get(DURABLE_SCRIPT_KEY).unwrap_or(false),
            error,
        }
    }
}

/// Runs model-written scripts against the registered host tools.
pub struct Interpreter {
    tools: ToolRegistry,
    interceptors: Vec<Arc<dyn Interceptor>>,
    limits: InterpreterConfig,
}

impl Interpreter {
    pub fn new(tools: ToolRegistry, limits: InterpreterConfig) -> Self {
        Self {
            tools,
            interceptors: Vec::new(),
            limits,
        }
    }

    /// Append an interceptor; earlier ones wrap later ones.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Statistics, durable-function, event-publisher, scratch-reset.
    pub fn with_default_interceptors(self, hub: Arc<EventHub>) -> Self {
        self.with_interceptor(Arc::new(Statistics))
            .with_interceptor(Arc::new(DurableFunction))
            .with_interceptor(Arc::new(EventPublisher::new(hub)))
            .with_interceptor(Arc::new(ScratchReset))
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn interceptor_names(&self) -> Vec<&str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    /// What the model is offered: the script tool plus each host tool.
    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions = vec![self.script_tool_definition()];
        definitions.extend(self.tools.definitions());
        definitions
    }

    fn script_tool_definition(&self) -> ToolDefinition {
        let mut description = String::from(
            "Run a Rhai script. Host functions take one object map argument and return the tool's result. \
             The value of the last expression is returned; print() output is captured.\nFunctions:\n",
        );
        for tool in self.tools.iter() {
            description.push_str(&format!(
                "- {}(#{{...}}): {}\n",
                tool.name(),
                tool.description()
            ));
        }
        ToolDefinition {
            name: CODE_INTERPRETER_TOOL.to_string(),
            description,
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "script": {
                        "type": "string",
                        "description": "Rhai source to execute"
                    }
                },
                "required": ["script"]
            }),
        }
    }

    /// Bind `tool` to `session` and wrap it in the interceptor chain.
    fn bind(
        &self,
        session: &Session,
        tool: &Arc<dyn HostTool>,
        cancel: &CancellationToken,
    ) -> ToolHandler {
        let base: ToolHandler = {
            let session = session.clone();
            let tool = tool.clone();
            let cancel = cancel.clone();
            Arc::new(move |input| {
                let session = session.clone();
                let tool = tool.clone();
                let cancel = cancel.clone();
                Box::pin(async move {
                    let name = tool.name().to_string();
                    session.set_current_tool(Some(name.clone()));
                    let durable = session
                        .get_temp::<bool>(DURABLE_CALL_KEY)
                        .unwrap_or(false);
                    let result = if durable {
                        tool.call(&session, input.clone()).await
                    } else {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => Err(ToolError::Cancelled(name.clone())),
                            result = tool.call(&session, input.clone()) => result,
                        }
                    };
                    session.record_call(FunctionCallRecord {
                        tool: name,
                        inputs: input,
                        output: result.as_ref().cloned().unwrap_or_default(),
                        error: result.as_ref().err().map(ToString::to_string),
                    });
                    session.set_current_tool(None);
                    result
                })
            })
        };
        wrap(&self.interceptors, session, tool, base)
    }

    /// Execute one script in a fresh sandbox.
    ///
    /// Never fails outright: errors land in [`ExecutionOutcome::error`]
    /// next to whatever calls completed before them.
    pub async fn execute(&self, invocation: &Invocation, script: &str) -> ExecutionOutcome {
        let session = Session::new(invocation.task_id.clone(), invocation.root.clone());
        let console = Console::default();
        let stop = StopFlag::new();
        let timeout = Duration::from_secs(self.limits.timeout_secs);

        let bindings = self
            .tools
            .iter()
            .map(|tool| {
                let handler = self.bind(&session, tool, &invocation.cancel);
                (tool.name().to_string(), handler)
            })
            .collect();
        let engine = sandbox::build_engine(
            &self.limits,
            stop.clone(),
            Instant::now() + timeout,
            console.clone(),
            bindings,
            Handle::current(),
        );

        let watcher = tokio::spawn({
            let cancel = invocation.cancel.clone();
            let stop = stop.clone();
            async move {
                cancel.cancelled().await;
                stop.signal(CANCELLED);
            }
        });

        debug!(task_id = %invocation.task_id, bytes = script.len(), "Executing script");

        let source = script.to_string();
        let mut run = tokio::task::spawn_blocking(move || {
            engine
                .eval::<rhai::Dynamic>(&source)
                .and_then(|value| rhai::serde::from_dynamic::<serde_json::Value>(&value))
        });

        let timeout_secs = self.limits.timeout_secs;
        let result = tokio::select! {
            joined = &mut run => match joined {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(sandbox::unwrap_error(&err, stop.get(), timeout_secs)),
                Err(join_err) => Err(InterpreterError::Crashed(join_err.to_string())),
            },
            err = self.overrun(&invocation.cancel, &session, timeout) => {
                warn!(task_id = %invocation.task_id, error = %err, "Abandoning script that did not unwind");
                Err(err)
            }
        };
        watcher.abort();

        let console = console
            .lock()
            .map(|c| c.clone())
            .unwrap_or_else(|e| e.into_inner().clone());
        ExecutionOutcome::collect(&session, console, result)
    }

    /// Resolves once a cancelled or overdue script should be abandoned.
    async fn overrun(
        &self,
        cancel: &CancellationToken,
        session: &Session,
        timeout: Duration,
    ) -> InterpreterError {
        let grace = Duration::from_millis(self.limits.cancel_grace_ms);
        tokio::select! {
            _ = tokio::time::sleep(timeout + grace) => InterpreterError::TimedOut(timeout.as_secs()),
            _ = async {
                cancel.cancelled().await;
                loop {
                    tokio::time::sleep(grace).await;
                    if !session.get_temp::<bool>(DURABLE_CALL_KEY).unwrap_or(false) {
                        break;
                    }
                }
            } => InterpreterError::Cancelled,
        }
    }

    /// Run one native tool call through the same interceptor chain.
    pub async fn call_tool(
        &self,
        invocation: &Invocation,
        name: &str,
        input: serde_json::Value,
    ) -> ExecutionOutcome {
        let session = Session::new(invocation.task_id.clone(), invocation.root.clone());
        let Some(tool) = self.tools.get(name) else {
            let err = ToolError::NotFound(name.to_string());
            let result = Err(InterpreterError::Script(err.to_string()));
            return ExecutionOutcome::collect(&session, String::new(), result);
        };

        debug!(task_id = %invocation.task_id, tool = %name, "Calling native tool");
        let handler = self.bind(&session, &tool, &invocation.cancel);
        let result = handler(input).await.map_err(|e| match e {
            ToolError::Cancelled(_) => InterpreterError::Cancelled,
            other => InterpreterError::Script(other.to_string()),
        });
        ExecutionOutcome::collect(&session, String::new(), result)
    }
}
