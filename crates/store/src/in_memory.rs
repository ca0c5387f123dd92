//! In-memory store: useful for testing and ephemeral deployments.
//!
//! One `RwLock` guards all state, so `commit_round` is atomic by holding the
//! write lock for the whole round.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use taskforge_core::agent::{Agent, Model, ProviderRecord};
use taskforge_core::error::StoreError;
use taskforge_core::message::Message;
use taskforge_core::store::{RoundCommit, Store, StoreResult};
use taskforge_core::task::{DesiredPhase, Phase, Task, TaskId};

#[derive(Default)]
struct State {
    providers: HashMap<String, ProviderRecord>,
    models: HashMap<String, Model>,
    agents: HashMap<String, Agent>,
    tasks: HashMap<TaskId, Task>,
    /// Per task, in insertion order
    messages: HashMap<TaskId, Vec<Message>>,
    /// message id -> owning task
    message_index: HashMap<String, TaskId>,
}

impl State {
    fn task_mut(&mut self, id: &TaskId) -> StoreResult<&mut Task> {
        self.tasks.get_mut(id).ok_or_else(|| StoreError::NotFound {
            kind: "task",
            id: id.to_string(),
        })
    }

    fn message_mut(&mut self, id: &str) -> StoreResult<&mut Message> {
        let not_found = || StoreError::NotFound {
            kind: "message",
            id: id.to_string(),
        };
        let task_id = self.message_index.get(id).ok_or_else(not_found)?;
        self.messages
            .get_mut(task_id)
            .and_then(|list| list.iter_mut().find(|m| m.id == id))
            .ok_or_else(not_found)
    }

    fn insert_message(&mut self, message: Message) -> StoreResult<()> {
        if !self.tasks.contains_key(&message.task_id) {
            return Err(StoreError::NotFound {
                kind: "task",
                id: message.task_id.to_string(),
            });
        }
        self.message_index
            .insert(message.id.clone(), message.task_id.clone());
        self.messages
            .entry(message.task_id.clone())
            .or_default()
            .push(message);
        Ok(())
    }
}

/// A store that keeps everything in process memory.
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn create_provider(&self, record: ProviderRecord) -> StoreResult<ProviderRecord> {
        self.state
            .write()
            .await
            .providers
            .insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn get_provider(&self, id: &str) -> StoreResult<Option<ProviderRecord>> {
        Ok(self.state.read().await.providers.get(id).cloned())
    }

    async fn create_model(&self, model: Model) -> StoreResult<Model> {
        self.state
            .write()
            .await
            .models
            .insert(model.id.clone(), model.clone());
        Ok(model)
    }

    async fn get_model(&self, id: &str) -> StoreResult<Option<Model>> {
        Ok(self.state.read().await.models.get(id).cloned())
    }

    async fn create_agent(&self, agent: Agent) -> StoreResult<Agent> {
        self.state
            .write()
            .await
            .agents
            .insert(agent.id.clone(), agent.clone());
        Ok(agent)
    }

    async fn get_agent(&self, id: &str) -> StoreResult<Option<Agent>> {
        Ok(self.state.read().await.agents.get(id).cloned())
    }

    async fn create_task(&self, task: Task) -> StoreResult<Task> {
        self.state
            .write()
            .await
            .tasks
            .insert(task.id.clone(), task.clone());
        Ok(task)
    }

    async fn get_task(&self, id: &TaskId) -> StoreResult<Option<Task>> {
        Ok(self.state.read().await.tasks.get(id).cloned())
    }

    async fn set_task_title(&self, id: &TaskId, title: &str) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let task = state.task_mut(id)?;
        task.title = Some(title.to_string());
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn set_desired_phase(&self, id: &TaskId, phase: DesiredPhase) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let task = state.task_mut(id)?;
        task.desired_phase = phase;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn set_observed_phase(&self, id: &TaskId, phase: Phase) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.task_mut(id)?.phase = phase;
        Ok(())
    }

    async fn list_pending_tasks(&self) -> StoreResult<Vec<TaskId>> {
        let state = self.state.read().await;
        let mut pending: Vec<TaskId> = state
            .messages
            .iter()
            .filter(|(_, list)| list.iter().any(|m| !m.is_processed()))
            .map(|(id, _)| id.clone())
            .collect();
        pending.sort();
        Ok(pending)
    }

    async fn create_message(&self, message: Message) -> StoreResult<Message> {
        self.state.write().await.insert_message(message.clone())?;
        Ok(message)
    }

    async fn list_messages(&self, task_id: &TaskId) -> StoreResult<Vec<Message>> {
        let state = self.state.read().await;
        let mut messages = state.messages.get(task_id).cloned().unwrap_or_default();
        // Stable: equal timestamps keep insertion order.
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    async fn mark_processed(&self, message_id: &str) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.message_mut(message_id)?.processed_at = Some(Utc::now());
        Ok(())
    }

    async fn commit_round(&self, commit: RoundCommit) -> StoreResult<()> {
        let mut state = self.state.write().await;

        // Validate everything before mutating anything.
        state.task_mut(&commit.task_id)?;
        state.message_mut(&commit.processed_message_id)?;

        state.message_mut(&commit.processed_message_id)?.processed_at = Some(Utc::now());
        if let Some(message) = commit.message {
            state.insert_message(message)?;
        }
        let task = state.task_mut(&commit.task_id)?;
        if let Some((usage, cost)) = commit.usage {
            task.usage.record(&usage, cost);
        }
        task.merge_tool_uses(&commit.tool_uses);
        task.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskforge_core::message::ContentBlock;
    use taskforge_core::provider::Usage;

    async fn store_with_task() -> (InMemoryStore, TaskId) {
        let store = InMemoryStore::new();
        let task = store.create_task(Task::new("agent-1", "/tmp")).await.unwrap();
        (store, task.id)
    }

    #[tokio::test]
    async fn backend_name() {
        assert_eq!(InMemoryStore::new().name(), "in_memory");
    }

    #[tokio::test]
    async fn message_for_unknown_task_rejected() {
        let store = InMemoryStore::new();
        let err = store
            .create_message(Message::user(TaskId::from("nope"), "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { kind: "task", .. }));
    }

    #[tokio::test]
    async fn commit_round_applies_everything() {
        let (store, task_id) = store_with_task().await;
        let pivot = store
            .create_message(Message::user(task_id.clone(), "hello"))
            .await
            .unwrap();
        let reply = Message::assistant(task_id.clone(), vec![ContentBlock::text("hi")]).processed();
        let usage = Usage {
            input_tokens: 10,
            output_tokens: 5,
            ..Default::default()
        };
        store
            .commit_round(
                RoundCommit::new(task_id.clone(), &pivot.id)
                    .with_message(reply)
                    .with_usage(usage, 0.01),
            )
            .await
            .unwrap();

        let messages = store.list_messages(&task_id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(Message::is_processed));
        let task = store.get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(task.usage.input_tokens, 10);
    }

    #[tokio::test]
    async fn failed_commit_leaves_no_trace() {
        let (store, task_id) = store_with_task().await;
        let reply = Message::assistant(task_id.clone(), vec![ContentBlock::text("orphan")]);
        let err = store
            .commit_round(RoundCommit::new(task_id.clone(), "missing-pivot").with_message(reply))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { kind: "message", .. }));
        assert!(store.list_messages(&task_id).await.unwrap().is_empty());
    }
}
