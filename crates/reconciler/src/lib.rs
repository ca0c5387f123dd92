//! # taskforge reconciler
//!
//! Drives tasks through `AwaitInput → InvokeModel → ExecuteTools → …`.
//! A fixed pool of workers pulls task ids from a deduplicating
//! [`DelayQueue`], and each pass recomputes the task's phase from the store
//! and performs exactly one step. Follow-up work is scheduled by re-queueing
//! the task id, never by recursion.

pub mod cancel;
pub mod prompt;
pub mod queue;
pub mod reconciler;
pub mod runtime;
pub mod status;
pub mod title;
pub mod worker;

pub use cancel::{CancelGuard, CancelRegistry};
pub use prompt::{PromptContext, render};
pub use queue::DelayQueue;
pub use reconciler::{ReconcileOutcome, Reconciler};
pub use runtime::Runtime;
pub use status::{Status, compute_status};
pub use title::{TitleGenerator, fallback_title};
pub use worker::run_worker;
