//! The task reconciler: one phase step per call.
//!
//! `reconcile` is level-triggered. It recomputes the task's status from the
//! store on every call, performs the single action that status asks for, and
//! tells the caller whether the task needs another pass.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use taskforge_config::ReconcilerConfig;
use taskforge_core::{
    Agent, ContentBlock, Error, EventHub, InterpreterError, InvokeOptions, Message,
    MessageSource, Model, PartialCallback, Phase, ProviderError, ProviderResolver, Result,
    RoundCommit, Store, Task, TaskEvent, TaskId,
};
use taskforge_interpreter::{ExecutionOutcome, Interpreter, Invocation};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cancel::CancelRegistry;
use crate::prompt::{PromptContext, render};
use crate::status::{Status, compute_status};
use crate::title::TitleGenerator;

/// What the worker should do with the task after a pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Re-queue after this delay
    pub retry_after: Option<Duration>,
    /// Re-queue immediately
    pub retry: bool,
}

impl ReconcileOutcome {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn requeue() -> Self {
        Self {
            retry_after: None,
            retry: true,
        }
    }

    pub fn after(delay: Duration) -> Self {
        Self {
            retry_after: Some(delay),
            retry: false,
        }
    }
}

pub struct Reconciler {
    store: Arc<dyn Store>,
    resolver: Arc<dyn ProviderResolver>,
    interpreter: Arc<Interpreter>,
    hub: Arc<EventHub>,
    titles: Arc<TitleGenerator>,
    cancels: CancelRegistry,
    shutdown: CancellationToken,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn Store>,
        resolver: Arc<dyn ProviderResolver>,
        interpreter: Arc<Interpreter>,
        hub: Arc<EventHub>,
        config: ReconcilerConfig,
    ) -> Self {
        let shutdown = CancellationToken::new();
        Self {
            titles: Arc::new(TitleGenerator::new(store.clone(), resolver.clone())),
            cancels: CancelRegistry::new(shutdown.clone()),
            store,
            resolver,
            interpreter,
            hub,
            shutdown,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub fn titles(&self) -> &Arc<TitleGenerator> {
        &self.titles
    }

    /// Parent of every per-task token; cancelling it stops all in-flight work.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Interrupt the in-flight pass of `task_id`. Returns whether one was running.
    pub fn cancel(&self, task_id: &TaskId) -> bool {
        let cancelled = self.cancels.cancel(task_id);
        if cancelled {
            info!(task_id = %task_id, "Cancelled in-flight reconciliation");
        }
        cancelled
    }

    /// Advance `task_id` by one phase step.
    ///
    /// Errors are published to the task's observers before being returned.
    pub async fn reconcile(&self, task_id: &TaskId) -> Result<ReconcileOutcome> {
        match self.step(task_id).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Reconciliation failed");
                self.hub.publish(task_id, TaskEvent::error(e.to_string())).await;
                Err(e)
            }
        }
    }

    async fn step(&self, task_id: &TaskId) -> Result<ReconcileOutcome> {
        // Registered for the whole pass so a suspend during the reads still lands.
        let guard = self.cancels.register(task_id);
        let cancel = guard.token();

        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| Error::not_found("task", task_id.as_str()))?;
        let agent = self
            .store
            .get_agent(&task.agent_id)
            .await?
            .ok_or_else(|| Error::not_found("agent", &task.agent_id))?;
        let model = self
            .store
            .get_model(&agent.model_id)
            .await?
            .ok_or_else(|| Error::not_found("model", &agent.model_id))?;

        let messages = self.store.list_messages(task_id).await?;

        if task.title.is_none()
            && let Some(request) = messages.iter().find(|m| m.source == MessageSource::User)
        {
            self.titles.spawn(&task, &request.text());
        }

        let status = compute_status(&task, messages);
        let phase = status.phase();
        debug!(task_id = %task_id, phase = ?phase, "Computed status");

        if cancel.is_cancelled() && status.pivot().is_some() {
            // Nothing has started yet, so the pivot stays for the next pass.
            info!(task_id = %task_id, "Cancelled before work started");
            return Ok(ReconcileOutcome::done());
        }

        if phase != task.phase {
            self.store.set_observed_phase(task_id, phase).await?;
            self.hub
                .publish(task_id, TaskEvent::PhaseChanged { phase })
                .await;
        }

        let result = match status {
            Status::AwaitInput | Status::Suspended => return Ok(ReconcileOutcome::done()),
            Status::InvokeModel { pivot, history } => {
                self.invoke_model(&task, &agent, &model, pivot, history, cancel)
                    .await
            }
            Status::ExecuteTools { pivot, .. } => self.execute_tools(&task, pivot, cancel).await,
        };

        self.settle(task_id).await;
        result
    }

    /// Report the task as idle once an active pass is over.
    async fn settle(&self, task_id: &TaskId) {
        if let Err(e) = self
            .store
            .set_observed_phase(task_id, Phase::AwaitInput)
            .await
        {
            warn!(task_id = %task_id, error = %e, "Failed to reset observed phase");
        }
        self.hub
            .publish(
                task_id,
                TaskEvent::PhaseChanged {
                    phase: Phase::AwaitInput,
                },
            )
            .await;
    }

    async fn invoke_model(
        &self,
        task: &Task,
        agent: &Agent,
        model: &Model,
        pivot: Message,
        history: Vec<Message>,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome> {
        if pivot.source == MessageSource::User {
            self.hub
                .publish(&task.id, TaskEvent::message(pivot.clone()))
                .await;
        }

        let record = self
            .store
            .get_provider(&model.provider_id)
            .await?
            .ok_or_else(|| Error::not_found("provider", &model.provider_id))?;
        let provider = match self.resolver.resolve(model, &record).await {
            Ok(provider) => provider,
            Err(e) => return self.provider_failure(&task.id, e).await,
        };

        let tools = self.interpreter.tool_definitions();
        let ctx = PromptContext::gather(
            &task.project_dir,
            self.config.listing_depth,
            self.config.listing_limit,
            tools.clone(),
        )
        .await;
        let system_prompt = render(&agent.instructions, &ctx);

        let mut conversation = history;
        conversation.push(pivot.clone());

        // Partial text is forwarded in order by one task so the callback never blocks.
        let reply_id = Uuid::new_v4().to_string();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let forwarder = tokio::spawn({
            let hub = self.hub.clone();
            let task_id = task.id.clone();
            let message_id = reply_id.clone();
            async move {
                while let Some(text) = rx.recv().await {
                    let event = TaskEvent::PartialMessage {
                        message_id: message_id.clone(),
                        text,
                    };
                    hub.publish(&task_id, event).await;
                }
            }
        });
        let on_partial: PartialCallback = Arc::new(move |chunk: &str| {
            let _ = tx.send(chunk.to_string());
        });
        let options = InvokeOptions::default()
            .with_tools(tools)
            .with_partial(on_partial)
            .with_max_tokens(model.max_output_tokens);

        info!(
            task_id = %task.id,
            provider = provider.name(),
            model = %model.name,
            history = conversation.len(),
            "Invoking model"
        );
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = provider.invoke(model, &system_prompt, &conversation, options) => Some(result),
        };
        let _ = forwarder.await;

        let response = match result {
            None | Some(Err(ProviderError::Cancelled)) => {
                return self.stop_cancelled(&task.id, &pivot).await;
            }
            Some(Err(e)) => return self.provider_failure(&task.id, e).await,
            Some(Ok(response)) => response,
        };

        let cost = model.pricing.cost(&response.usage);
        let is_final = !response.content.iter().any(ContentBlock::is_tool_call);
        let mut reply = Message::assistant(task.id.clone(), response.content);
        reply.id = reply_id;
        reply.usage = Some(response.usage);
        reply.cost = Some(cost);
        reply.model = Some(response.model);
        reply.is_final_response = is_final;
        if is_final {
            reply = reply.processed();
        }

        let commit = RoundCommit::new(task.id.clone(), pivot.id.clone())
            .with_message(reply.clone())
            .with_usage(response.usage, cost);
        self.store.commit_round(commit).await?;
        info!(
            task_id = %task.id,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            cost,
            is_final,
            "Model round committed"
        );

        self.hub.publish(&task.id, TaskEvent::message(reply)).await;
        Ok(ReconcileOutcome::requeue())
    }

    /// A cancelled model call is a deliberate stop, not a failure.
    async fn stop_cancelled(&self, task_id: &TaskId, pivot: &Message) -> Result<ReconcileOutcome> {
        if self.shutdown.is_cancelled() {
            // Left unprocessed so the next start picks it up again.
            info!(task_id = %task_id, "Model call interrupted by shutdown");
            return Ok(ReconcileOutcome::done());
        }
        self.store.mark_processed(&pivot.id).await?;
        info!(task_id = %task_id, message_id = %pivot.id, "Model call cancelled");
        Ok(ReconcileOutcome::done())
    }

    async fn provider_failure(
        &self,
        task_id: &TaskId,
        err: ProviderError,
    ) -> Result<ReconcileOutcome> {
        if !err.is_retryable() {
            return Err(err.into());
        }
        let delay = err
            .retry_after()
            .unwrap_or(Duration::from_secs(self.config.default_retry_secs));
        warn!(
            task_id = %task_id,
            error = %err,
            retry_after_secs = delay.as_secs(),
            "Provider error, retrying later"
        );
        self.hub
            .publish(task_id, TaskEvent::error(err.to_string()))
            .await;
        Ok(ReconcileOutcome::after(delay))
    }

    async fn execute_tools(
        &self,
        task: &Task,
        pivot: Message,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome> {
        let invocation = Invocation::new(task.id.clone(), task.project_dir.clone(), cancel.clone());
        let mut results = Vec::new();
        let mut tool_uses: BTreeMap<String, u64> = BTreeMap::new();

        for block in &pivot.content {
            let (call_id, outcome, native) = match block {
                ContentBlock::CodeInterpreterCall { id, script } => {
                    let outcome = if cancel.is_cancelled() {
                        cancelled_outcome()
                    } else {
                        self.interpreter.execute(&invocation, script).await
                    };
                    (id, outcome, None)
                }
                ContentBlock::NativeToolCall { id, name, input } => {
                    let outcome = if cancel.is_cancelled() {
                        cancelled_outcome()
                    } else {
                        self.interpreter
                            .call_tool(&invocation, name, input.clone())
                            .await
                    };
                    (id, outcome, Some(name))
                }
                _ => continue,
            };

            if let Some(err) = &outcome.error {
                debug!(task_id = %task.id, call_id = %call_id, error = %err, "Tool call failed");
            }
            for (tool, count) in &outcome.tool_uses {
                *tool_uses.entry(tool.clone()).or_insert(0) += count;
            }
            results.push(result_block(call_id, outcome, native));
        }

        let calls = results.len();
        let message = Message::system(task.id.clone(), results);
        let commit = RoundCommit::new(task.id.clone(), pivot.id.clone())
            .with_message(message.clone())
            .with_tool_uses(tool_uses);
        self.store.commit_round(commit).await?;
        info!(task_id = %task.id, calls, cancelled = cancel.is_cancelled(), "Tool round committed");

        self.hub.publish(&task.id, TaskEvent::message(message)).await;
        Ok(ReconcileOutcome::requeue())
    }
}

fn cancelled_outcome() -> ExecutionOutcome {
    ExecutionOutcome {
        error: Some(InterpreterError::Cancelled),
        ..Default::default()
    }
}

fn result_block(call_id: &str, outcome: ExecutionOutcome, native: Option<&String>) -> ContentBlock {
    let error = outcome.error_message();
    match native {
        Some(name) => ContentBlock::NativeToolResult {
            call_id: call_id.to_string(),
            name: name.clone(),
            output: outcome.output,
            error,
        },
        None => ContentBlock::CodeInterpreterResult {
            call_id: call_id.to_string(),
            output: outcome.output,
            console: outcome.console,
            function_calls: outcome.function_calls,
            error,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_constructors() {
        assert_eq!(ReconcileOutcome::done(), ReconcileOutcome::default());
        assert!(ReconcileOutcome::requeue().retry);
        let later = ReconcileOutcome::after(Duration::from_secs(3));
        assert_eq!(later.retry_after, Some(Duration::from_secs(3)));
        assert!(!later.retry);
    }

    #[test]
    fn cancelled_calls_carry_user_facing_error() {
        let block = result_block("c1", cancelled_outcome(), None);
        match block {
            ContentBlock::CodeInterpreterResult { call_id, error, .. } => {
                assert_eq!(call_id, "c1");
                assert_eq!(error.as_deref(), Some("execution was cancelled"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn native_results_keep_tool_name() {
        let outcome = ExecutionOutcome {
            output: serde_json::json!({"exit_code": 0}),
            ..Default::default()
        };
        let name = "shell".to_string();
        match result_block("c2", outcome, Some(&name)) {
            ContentBlock::NativeToolResult { name, output, error, .. } => {
                assert_eq!(name, "shell");
                assert_eq!(output["exit_code"], 0);
                assert!(error.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
