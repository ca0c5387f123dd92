//! Worker loop: pop a task, reconcile it, schedule the follow-up.

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use taskforge_core::TaskId;
use tracing::{debug, error, warn};

use crate::queue::DelayQueue;
use crate::reconciler::Reconciler;

/// Process tasks from `queue` until it is shut down and drained.
pub async fn run_worker(id: usize, reconciler: Arc<Reconciler>, queue: DelayQueue<TaskId>) {
    debug!(worker = id, "Worker started");
    while let Some(task_id) = queue.get().await {
        process(id, &reconciler, &queue, &task_id).await;
        queue.done(&task_id);
    }
    debug!(worker = id, "Worker stopped");
}

async fn process(
    worker: usize,
    reconciler: &Reconciler,
    queue: &DelayQueue<TaskId>,
    task_id: &TaskId,
) {
    let result = AssertUnwindSafe(reconciler.reconcile(task_id))
        .catch_unwind()
        .await;

    match result {
        Ok(Ok(outcome)) => {
            if let Some(delay) = outcome.retry_after {
                debug!(worker, task_id = %task_id, delay = ?delay, "Retry scheduled");
                queue.add_after(task_id.clone(), delay);
            } else if outcome.retry {
                queue.add(task_id.clone());
            }
        }
        Ok(Err(e)) => {
            // Already published by the reconciler; wait for the next trigger.
            warn!(worker, task_id = %task_id, error = %e, "Reconciliation ended with error");
        }
        Err(payload) => {
            error!(
                worker,
                task_id = %task_id,
                panic = %panic_message(payload.as_ref()),
                "Reconciliation panicked"
            );
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_are_readable() {
        let payload = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload = std::panic::catch_unwind(|| panic!("code {}", 7)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "code 7");
    }
}
