//! Sandboxed script interpreter for taskforge.
//!
//! Each run gets a fresh rhai engine whose only capabilities are the
//! registered host tools. Every tool call goes through an ordered
//! [`Interceptor`] chain, and a cancellation watcher interrupts the script
//! when the caller's token fires.

pub mod interceptor;
pub mod interceptors;
pub mod interpreter;
mod sandbox;

pub use interceptor::{Interceptor, ToolFuture, ToolHandler, wrap};
pub use interceptors::{
    DURABLE_CALL_KEY, DURABLE_SCRIPT_KEY, DurableFunction, EventPublisher, ScratchReset,
    Statistics, TOOL_USES_KEY,
};
pub use interpreter::{ExecutionOutcome, Interpreter, Invocation};
