//! Built-in interceptors.

use std::collections::BTreeMap;
use std::sync::Arc;
use taskforge_core::event::TaskEvent;
use taskforge_core::hub::EventHub;
use taskforge_core::session::Session;
use taskforge_core::tool::HostTool;

use crate::interceptor::{Interceptor, ToolHandler};

/// Session key holding a `BTreeMap<String, u64>` of calls per tool.
pub const TOOL_USES_KEY: &str = "tool_uses";

/// Session key set once any durable tool has been called.
pub const DURABLE_SCRIPT_KEY: &str = "durable";

/// Temp key set while a durable call is running.
pub const DURABLE_CALL_KEY: &str = "durable_call";

/// Counts invocations per tool name.
pub struct Statistics;

impl Interceptor for Statistics {
    fn name(&self) -> &str {
        "statistics"
    }

    fn intercept(
        &self,
        session: &Session,
        tool: &Arc<dyn HostTool>,
        next: ToolHandler,
    ) -> ToolHandler {
        let session = session.clone();
        let tool_name = tool.name().to_string();
        Arc::new(move |input| {
            session.update::<BTreeMap<String, u64>, _>(TOOL_USES_KEY, |uses| {
                *uses.entry(tool_name.clone()).or_default() += 1;
            });
            next(input)
        })
    }
}

/// Marks calls to durable tools so cancellation lets them finish.
pub struct DurableFunction;

impl Interceptor for DurableFunction {
    fn name(&self) -> &str {
        "durable_function"
    }

    fn intercept(
        &self,
        session: &Session,
        tool: &Arc<dyn HostTool>,
        next: ToolHandler,
    ) -> ToolHandler {
        if !tool.is_durable() {
            return next;
        }
        let session = session.clone();
        Arc::new(move |input| {
            session.set(DURABLE_SCRIPT_KEY, true);
            session.set_temp(DURABLE_CALL_KEY, true);
            next(input)
        })
    }
}

/// Publishes a tool-call/tool-result pair per invocation.
pub struct EventPublisher {
    hub: Arc<EventHub>,
}

impl EventPublisher {
    pub fn new(hub: Arc<EventHub>) -> Self {
        Self { hub }
    }
}

impl Interceptor for EventPublisher {
    fn name(&self) -> &str {
        "event_publisher"
    }

    fn intercept(
        &self,
        session: &Session,
        tool: &Arc<dyn HostTool>,
        next: ToolHandler,
    ) -> ToolHandler {
        let hub = self.hub.clone();
        let task_id = session.task_id().clone();
        let tool_name = tool.name().to_string();
        Arc::new(move |input| {
            let hub = hub.clone();
            let task_id = task_id.clone();
            let tool_name = tool_name.clone();
            let next = next.clone();
            Box::pin(async move {
                hub.publish(
                    &task_id,
                    TaskEvent::ToolCall {
                        tool: tool_name.clone(),
                        input: input.clone(),
                    },
                )
                .await;
                let result = next(input).await;
                let (output, error) = match &result {
                    Ok(output) => (output.clone(), None),
                    Err(e) => (serde_json::Value::Null, Some(e.to_string())),
                };
                hub.publish(
                    &task_id,
                    TaskEvent::ToolResult {
                        tool: tool_name,
                        output,
                        error,
                    },
                )
                .await;
                result
            })
        })
    }
}

/// Clears per-call scratch values once the call returns.
pub struct ScratchReset;

impl Interceptor for ScratchReset {
    fn name(&self) -> &str {
        "scratch_reset"
    }

    fn intercept(
        &self,
        session: &Session,
        _tool: &Arc<dyn HostTool>,
        next: ToolHandler,
    ) -> ToolHandler {
        let session = session.clone();
        Arc::new(move |input| {
            let session = session.clone();
            let next = next.clone();
            Box::pin(async move {
                let result = next(input).await;
                session.clear_temp();
                result
            })
        })
    }
}
