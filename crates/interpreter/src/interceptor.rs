//! Interceptor pipeline around host tool calls.
//!
//! An interceptor turns one tool handler into another. The chain is applied
//! so that the first registered interceptor is outermost: given `[A, B]`,
//! a call runs A's pre-logic, B's pre-logic, the tool, B's post-logic, then
//! A's post-logic.

use futures::future::BoxFuture;
use std::sync::Arc;
use taskforge_core::error::ToolError;
use taskforge_core::session::Session;
use taskforge_core::tool::HostTool;

pub type ToolFuture = BoxFuture<'static, Result<serde_json::Value, ToolError>>;

/// A callable tool invocation, already bound to its session.
pub type ToolHandler = Arc<dyn Fn(serde_json::Value) -> ToolFuture + Send + Sync>;

/// Middleware for tool invocations.
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &str;

    /// Wrap `next` for calls of `tool` within `session`.
    fn intercept(
        &self,
        session: &Session,
        tool: &Arc<dyn HostTool>,
        next: ToolHandler,
    ) -> ToolHandler;
}

/// Wrap `base` in `interceptors`, first entry outermost.
pub fn wrap(
    interceptors: &[Arc<dyn Interceptor>],
    session: &Session,
    tool: &Arc<dyn HostTool>,
    base: ToolHandler,
) -> ToolHandler {
    interceptors
        .iter()
        .rev()
        .fold(base, |next, interceptor| {
            interceptor.intercept(session, tool, next)
        })
}
