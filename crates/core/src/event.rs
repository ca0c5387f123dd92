//! Domain event system: decoupled communication between bounded contexts.
//!
//! `DomainEvent`s travel on a process-wide broadcast bus and trigger
//! reconciliation. `TaskEvent`s are per-task and go to live observers
//! through the [`EventHub`](crate::hub::EventHub).

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::message::Message;
use crate::task::{Phase, TaskId};

/// Triggers fired by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainEvent {
    /// Persisted state of a task changed; reconcile it.
    TaskChanged { task_id: TaskId },

    /// The task's desired phase became suspended; interrupt in-flight work.
    TaskSuspended { task_id: TaskId },
}

impl DomainEvent {
    pub fn task_id(&self) -> &TaskId {
        match self {
            Self::TaskChanged { task_id } | Self::TaskSuspended { task_id } => task_id,
        }
    }
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
/// Components can subscribe to receive all events and filter for what they care about.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // Ignore send errors (no subscribers = that's fine)
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// What a live observer of one task sees.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// A complete message, replayed or newly persisted
    Message { message: Message },

    /// Streamed text of an assistant message that is still being generated
    PartialMessage { message_id: String, text: String },

    PhaseChanged { phase: Phase },

    ToolCall {
        tool: String,
        input: serde_json::Value,
    },

    ToolResult {
        tool: String,
        #[serde(default)]
        output: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    Error { message: String },
}

impl TaskEvent {
    /// SSE event name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::PartialMessage { .. } => "partial_message",
            Self::PhaseChanged { .. } => "phase_changed",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::Error { .. } => "error",
        }
    }

    pub fn message(message: Message) -> Self {
        Self::Message { message }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}
