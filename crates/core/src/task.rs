//! Task domain types.
//!
//! A task is one agent conversation. Its observed phase is recomputed from
//! persisted messages on every reconciliation; the desired phase is the only
//! piece of intent set from outside.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

use crate::provider::Usage;

/// Unique identifier for a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the operator wants the task to be doing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredPhase {
    #[default]
    Normal,
    Suspended,
}

impl DesiredPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Suspended => "suspended",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(Self::Normal),
            "suspended" => Some(Self::Suspended),
            _ => None,
        }
    }
}

/// Position of a task in the reconciliation state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Nothing left to do until new input arrives.
    #[default]
    AwaitInput,
    /// Desired phase is suspended.
    Suspended,
    /// An unprocessed user or system message is next.
    InvokeModel,
    /// An unprocessed assistant message carries pending tool calls.
    ExecuteTools,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwaitInput => "await_input",
            Self::Suspended => "suspended",
            Self::InvokeModel => "invoke_model",
            Self::ExecuteTools => "execute_tools",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "await_input" => Some(Self::AwaitInput),
            "suspended" => Some(Self::Suspended),
            "invoke_model" => Some(Self::InvokeModel),
            "execute_tools" => Some(Self::ExecuteTools),
            _ => None,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Running usage counters for a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_write_tokens: u64,
    pub cache_read_tokens: u64,
    pub cost: f64,
}

impl TaskUsage {
    pub fn record(&mut self, usage: &Usage, cost: f64) {
        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;
        self.cache_write_tokens += usage.cache_write_tokens;
        self.cache_read_tokens += usage.cache_read_tokens;
        self.cost += cost;
    }
}

/// One agent conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,

    /// Owning agent
    pub agent_id: String,

    /// Short description, generated once from the first user message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default)]
    pub desired_phase: DesiredPhase,

    /// Last phase the reconciler computed
    #[serde(default)]
    pub phase: Phase,

    #[serde(default)]
    pub usage: TaskUsage,

    /// Invocation count per tool name
    #[serde(default)]
    pub tool_uses: BTreeMap<String, u64>,

    /// Sandbox root for tools and scripts
    pub project_dir: PathBuf,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(agent_id: impl Into<String>, project_dir: impl Into<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            agent_id: agent_id.into(),
            title: None,
            desired_phase: DesiredPhase::Normal,
            phase: Phase::AwaitInput,
            usage: TaskUsage::default(),
            tool_uses: BTreeMap::new(),
            project_dir: project_dir.into(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn is_suspended(&self) -> bool {
        self.desired_phase == DesiredPhase::Suspended
    }

    /// Add per-tool counts into the running totals.
    pub fn merge_tool_uses(&mut self, counts: &BTreeMap<String, u64>) {
        for (name, count) in counts {
            *self.tool_uses.entry(name.clone()).or_insert(0) += count;
        }
    }
}
