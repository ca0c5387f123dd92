//! # taskforge core
//!
//! Domain types, traits, and error definitions for the taskforge task
//! reconciliation engine. Every subsystem the reconciler talks to is a trait
//! here; implementations live in their own crates.
//!
//! ## Design Philosophy
//!
//! - Tasks and messages are plain data; phase is recomputed from them
//! - Stores, model providers, and host tools are swappable behind traits
//! - Clean dependency graph (all crates depend inward on core)

pub mod agent;
pub mod error;
pub mod event;
pub mod hub;
pub mod message;
pub mod provider;
pub mod session;
pub mod store;
pub mod task;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use agent::{Agent, Model, ModelPricing, ProviderKind, ProviderRecord};
pub use error::{Error, InterpreterError, ProviderError, Result, StoreError, ToolError};
pub use event::{DomainEvent, EventBus, TaskEvent};
pub use hub::{EventHub, Subscription};
pub use message::{CODE_INTERPRETER_TOOL, ContentBlock, Message, MessageSource};
pub use provider::{
    InvokeOptions, InvokeResponse, ModelProvider, PartialCallback, ProviderResolver,
    ToolDefinition, Usage,
};
pub use session::{FunctionCallRecord, Session};
pub use store::{RoundCommit, Store, StoreResult};
pub use task::{DesiredPhase, Phase, Task, TaskId, TaskUsage};
pub use tool::{HostTool, ToolRegistry};
