//! Store trait: persistence for tasks, messages, agents, and models.
//!
//! The reconciler treats the store as a black box with one hard requirement:
//! `commit_round` applies "mark pivot processed + persist result + update
//! counters" atomically. A half-applied round would make the pivot run twice.

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::agent::{Agent, Model, ProviderRecord};
use crate::error::StoreError;
use crate::message::Message;
use crate::provider::Usage;
use crate::task::{DesiredPhase, Phase, Task, TaskId};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Everything one reconciliation round writes.
#[derive(Debug, Clone)]
pub struct RoundCommit {
    pub task_id: TaskId,

    /// Pivot to mark processed
    pub processed_message_id: String,

    /// Assistant reply or tool-result message to insert
    pub message: Option<Message>,

    /// Model usage and its cost, added to the task's counters
    pub usage: Option<(Usage, f64)>,

    /// Tool invocation counts, merged into the task's counters
    pub tool_uses: BTreeMap<String, u64>,
}

impl RoundCommit {
    pub fn new(task_id: TaskId, processed_message_id: impl Into<String>) -> Self {
        Self {
            task_id,
            processed_message_id: processed_message_id.into(),
            message: None,
            usage: None,
            tool_uses: BTreeMap::new(),
        }
    }

    pub fn with_message(mut self, message: Message) -> Self {
        self.message = Some(message);
        self
    }

    pub fn with_usage(mut self, usage: Usage, cost: f64) -> Self {
        self.usage = Some((usage, cost));
        self
    }

    pub fn with_tool_uses(mut self, tool_uses: BTreeMap<String, u64>) -> Self {
        self.tool_uses = tool_uses;
        self
    }
}

/// The core Store trait.
///
/// `get_*` return `Ok(None)` for unknown ids; mutations on unknown ids fail
/// with `StoreError::NotFound`.
#[async_trait]
pub trait Store: Send + Sync {
    /// Backend name for logging (e.g., "sqlite").
    fn name(&self) -> &str;

    // --- Providers and models ---

    async fn create_provider(&self, record: ProviderRecord) -> StoreResult<ProviderRecord>;
    async fn get_provider(&self, id: &str) -> StoreResult<Option<ProviderRecord>>;

    async fn create_model(&self, model: Model) -> StoreResult<Model>;
    async fn get_model(&self, id: &str) -> StoreResult<Option<Model>>;

    // --- Agents ---

    async fn create_agent(&self, agent: Agent) -> StoreResult<Agent>;
    async fn get_agent(&self, id: &str) -> StoreResult<Option<Agent>>;

    // --- Tasks ---

    async fn create_task(&self, task: Task) -> StoreResult<Task>;
    async fn get_task(&self, id: &TaskId) -> StoreResult<Option<Task>>;
    async fn set_task_title(&self, id: &TaskId, title: &str) -> StoreResult<()>;
    async fn set_desired_phase(&self, id: &TaskId, phase: DesiredPhase) -> StoreResult<()>;
    async fn set_observed_phase(&self, id: &TaskId, phase: Phase) -> StoreResult<()>;

    /// Tasks with at least one unprocessed message.
    async fn list_pending_tasks(&self) -> StoreResult<Vec<TaskId>>;

    // --- Messages ---

    async fn create_message(&self, message: Message) -> StoreResult<Message>;

    /// All messages of a task in creation order.
    async fn list_messages(&self, task_id: &TaskId) -> StoreResult<Vec<Message>>;

    async fn mark_processed(&self, message_id: &str) -> StoreResult<()>;

    /// Apply one round atomically.
    async fn commit_round(&self, commit: RoundCommit) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_commit_builder() {
        let mut counts = BTreeMap::new();
        counts.insert("shell".to_string(), 2);
        let commit = RoundCommit::new(TaskId::from("t1"), "m1")
            .with_usage(Usage::default(), 0.5)
            .with_tool_uses(counts);
        assert_eq!(commit.processed_message_id, "m1");
        assert!(commit.message.is_none());
        assert_eq!(commit.usage.map(|(_, c)| c), Some(0.5));
        assert_eq!(commit.tool_uses["shell"], 2);
    }
}
