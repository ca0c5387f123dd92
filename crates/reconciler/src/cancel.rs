//! Per-task cancellation registry.
//!
//! Each reconciliation registers a child of the runtime's shutdown token for
//! its task and holds the returned guard until it finishes. Suspending a task
//! cancels whatever is registered for it at that moment.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use taskforge_core::TaskId;
use tokio_util::sync::CancellationToken;

type Entries = HashMap<TaskId, (u64, CancellationToken)>;

#[derive(Clone)]
pub struct CancelRegistry {
    root: CancellationToken,
    entries: Arc<Mutex<Entries>>,
    generation: Arc<AtomicU64>,
}

impl CancelRegistry {
    pub fn new(root: CancellationToken) -> Self {
        Self {
            root,
            entries: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a fresh token for `task_id`, replacing any previous one.
    pub fn register(&self, task_id: &TaskId) -> CancelGuard {
        let token = self.root.child_token();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        self.lock()
            .insert(task_id.clone(), (generation, token.clone()));
        CancelGuard {
            registry: self.clone(),
            task_id: task_id.clone(),
            generation,
            token,
        }
    }

    /// Cancel the in-flight reconciliation of `task_id`, if any.
    pub fn cancel(&self, task_id: &TaskId) -> bool {
        match self.lock().get(task_id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, task_id: &TaskId) -> bool {
        self.lock().contains_key(task_id)
    }
}

/// Keeps a task's token registered until dropped.
pub struct CancelGuard {
    registry: CancelRegistry,
    task_id: TaskId,
    generation: u64,
    token: CancellationToken,
}

impl CancelGuard {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        let mut entries = self.registry.lock();
        // A newer registration for the same task stays in place.
        if entries
            .get(&self.task_id)
            .is_some_and(|(generation, _)| *generation == self.generation)
        {
            entries.remove(&self.task_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_reaches_registered_token() {
        let registry = CancelRegistry::new(CancellationToken::new());
        let task = TaskId::from("t1");
        let guard = registry.register(&task);

        assert!(registry.cancel(&task));
        assert!(guard.token().is_cancelled());
    }

    #[test]
    fn cancel_without_registration_is_noop() {
        let registry = CancelRegistry::new(CancellationToken::new());
        assert!(!registry.cancel(&TaskId::from("idle")));
    }

    #[test]
    fn drop_unregisters() {
        let registry = CancelRegistry::new(CancellationToken::new());
        let task = TaskId::from("t1");
        drop(registry.register(&task));
        assert!(!registry.is_registered(&task));
    }

    #[test]
    fn stale_guard_keeps_newer_registration() {
        let registry = CancelRegistry::new(CancellationToken::new());
        let task = TaskId::from("t1");
        let old = registry.register(&task);
        let new = registry.register(&task);

        drop(old);
        assert!(registry.is_registered(&task));
        registry.cancel(&task);
        assert!(new.token().is_cancelled());
    }

    #[test]
    fn shutdown_cancels_every_task() {
        let root = CancellationToken::new();
        let registry = CancelRegistry::new(root.clone());
        let a = registry.register(&TaskId::from("a"));
        let b = registry.register(&TaskId::from("b"));

        root.cancel();
        assert!(a.token().is_cancelled());
        assert!(b.token().is_cancelled());
    }
}
