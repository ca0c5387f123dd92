//! Runtime: worker pool, trigger listeners, and coordinated shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use taskforge_core::{DomainEvent, Error, EventBus, Result, TaskId};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::queue::DelayQueue;
use crate::reconciler::Reconciler;
use crate::worker::run_worker;

/// Time given to cancelled work to unwind before workers are aborted.
const ABORT_GRACE: Duration = Duration::from_secs(2);

pub struct Runtime {
    reconciler: Arc<Reconciler>,
    bus: Arc<EventBus>,
    queue: DelayQueue<TaskId>,
    workers: JoinSet<()>,
    listeners: JoinSet<()>,
    stop_listening: CancellationToken,
}

impl Runtime {
    pub fn new(reconciler: Arc<Reconciler>, bus: Arc<EventBus>) -> Self {
        Self {
            reconciler,
            bus,
            queue: DelayQueue::new(),
            workers: JoinSet::new(),
            listeners: JoinSet::new(),
            stop_listening: CancellationToken::new(),
        }
    }

    pub fn queue(&self) -> &DelayQueue<TaskId> {
        &self.queue
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Subscribe to triggers, enqueue pending tasks, and start the workers.
    pub async fn start(&mut self) -> Result<()> {
        // Subscribe first so nothing fired during the resync is missed.
        let changes = self.bus.subscribe();
        let suspensions = self.bus.subscribe();

        let pending = resync(&self.reconciler, &self.queue).await?;

        self.listeners.spawn(listen(
            changes,
            Trigger::Changed,
            self.reconciler.clone(),
            self.queue.clone(),
            self.stop_listening.clone(),
        ));
        self.listeners.spawn(listen(
            suspensions,
            Trigger::Suspended,
            self.reconciler.clone(),
            self.queue.clone(),
            self.stop_listening.clone(),
        ));

        let concurrency = self.reconciler.config().concurrency.max(1);
        for id in 0..concurrency {
            self.workers
                .spawn(run_worker(id, self.reconciler.clone(), self.queue.clone()));
        }
        info!(workers = concurrency, pending, "Reconciler started");
        Ok(())
    }

    /// Run the reconciler next to `server` until either stops or `signal` fires.
    pub async fn run<S, E, F>(mut self, server: S, signal: F) -> Result<()>
    where
        S: Future<Output = std::result::Result<(), E>>,
        E: std::fmt::Display,
        F: Future<Output = ()>,
    {
        self.start().await?;
        let outcome = tokio::select! {
            result = server => {
                result.map_err(|e| Error::Internal(format!("server stopped: {e}")))
            }
            _ = signal => {
                info!("Shutdown signal received");
                Ok(())
            }
        };
        self.shutdown().await;
        outcome
    }

    /// Stop accepting work, drain the queue, then force-stop stragglers.
    pub async fn shutdown(mut self) {
        self.stop_listening.cancel();
        while self.listeners.join_next().await.is_some() {}

        self.queue.shutdown();
        let timeout = Duration::from_secs(self.reconciler.config().shutdown_timeout_secs);
        let workers = &mut self.workers;
        let drained = tokio::time::timeout(timeout, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_ok() {
            info!("Reconciler stopped");
            return;
        }

        warn!(
            timeout_secs = timeout.as_secs(),
            "Workers still busy after shutdown timeout, cancelling in-flight work"
        );
        self.reconciler.shutdown_token().cancel();
        let workers = &mut self.workers;
        let unwound = tokio::time::timeout(ABORT_GRACE, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if unwound.is_err() {
            self.workers.abort_all();
            while self.workers.join_next().await.is_some() {}
        }
        info!("Reconciler stopped");
    }
}

#[derive(Debug, Clone, Copy)]
enum Trigger {
    Changed,
    Suspended,
}

/// Enqueue every task that still has unprocessed messages.
async fn resync(reconciler: &Reconciler, queue: &DelayQueue<TaskId>) -> Result<usize> {
    let pending = reconciler.store().list_pending_tasks().await?;
    let count = pending.len();
    for task_id in pending {
        queue.add(task_id);
    }
    Ok(count)
}

async fn listen(
    mut events: broadcast::Receiver<Arc<DomainEvent>>,
    trigger: Trigger,
    reconciler: Arc<Reconciler>,
    queue: DelayQueue<TaskId>,
    stop: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            _ = stop.cancelled() => break,
            received = events.recv() => received,
        };
        match received {
            Ok(event) => match (trigger, event.as_ref()) {
                (Trigger::Changed, DomainEvent::TaskChanged { task_id }) => {
                    debug!(task_id = %task_id, "Task changed");
                    queue.add(task_id.clone());
                }
                (Trigger::Suspended, DomainEvent::TaskSuspended { task_id }) => {
                    reconciler.cancel(task_id);
                    queue.add(task_id.clone());
                }
                _ => {}
            },
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, trigger = ?trigger, "Trigger listener lagged, resyncing");
                if let Err(e) = resync(&reconciler, &queue).await {
                    warn!(error = %e, "Resync failed");
                }
            }
            Err(RecvError::Closed) => break,
        }
    }
}
