//! Per-task event fan-out.
//!
//! `publish` snapshots the subscriber list and delivers without holding the
//! lock, so a slow subscriber never blocks registration. Each subscriber has
//! its own bounded channel: a full one stalls only its own delivery.

use futures::Stream;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::StoreError;
use crate::event::TaskEvent;
use crate::message::Message;
use crate::store::Store;
use crate::task::TaskId;

type Subscribers = HashMap<TaskId, Vec<(u64, mpsc::Sender<TaskEvent>)>>;

pub struct EventHub {
    store: Arc<dyn Store>,
    capacity: usize,
    subscribers: Arc<Mutex<Subscribers>>,
    next_id: AtomicU64,
}

impl EventHub {
    pub fn new(store: Arc<dyn Store>, capacity: usize) -> Self {
        Self {
            store,
            capacity: capacity.max(1),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Deliver `event` to every current subscriber of `task_id`.
    pub async fn publish(&self, task_id: &TaskId, event: TaskEvent) {
        let senders: Vec<mpsc::Sender<TaskEvent>> = lock(&self.subscribers)
            .get(task_id)
            .map(|subs| subs.iter().map(|(_, tx)| tx.clone()).collect())
            .unwrap_or_default();
        if senders.is_empty() {
            return;
        }

        futures::future::join_all(senders.iter().map(|tx| {
            let event = event.clone();
            async move {
                // Receiver gone: its guard unregisters it.
                let _ = tx.send(event).await;
            }
        }))
        .await;
    }

    /// Subscribe to a task: processed history first, then live events until
    /// `cancel` fires or the subscription is dropped.
    pub async fn subscribe(
        &self,
        task_id: &TaskId,
        cancel: CancellationToken,
    ) -> Result<Subscription, StoreError> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        // Register before reading history so nothing published in between
        // is lost.
        lock(&self.subscribers)
            .entry(task_id.clone())
            .or_default()
            .push((id, tx));
        let guard = SubscriberGuard {
            subscribers: self.subscribers.clone(),
            task_id: task_id.clone(),
            id,
        };

        let replay: VecDeque<Message> = self
            .store
            .list_messages(task_id)
            .await?
            .into_iter()
            .filter(Message::is_processed)
            .collect();
        debug!(task_id = %task_id, replay = replay.len(), "Subscriber registered");

        Ok(Subscription {
            replay,
            rx,
            cancel,
            _guard: guard,
        })
    }

    pub fn subscriber_count(&self, task_id: &TaskId) -> usize {
        lock(&self.subscribers).get(task_id).map_or(0, Vec::len)
    }
}

fn lock(subscribers: &Mutex<Subscribers>) -> MutexGuard<'_, Subscribers> {
    subscribers.lock().unwrap_or_else(|e| e.into_inner())
}

struct SubscriberGuard {
    subscribers: Arc<Mutex<Subscribers>>,
    task_id: TaskId,
    id: u64,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        let mut subs = lock(&self.subscribers);
        if let Some(list) = subs.get_mut(&self.task_id) {
            list.retain(|(id, _)| *id != self.id);
            if list.is_empty() {
                subs.remove(&self.task_id);
            }
        }
    }
}

/// A live view of one task's events.
pub struct Subscription {
    replay: VecDeque<Message>,
    rx: mpsc::Receiver<TaskEvent>,
    cancel: CancellationToken,
    _guard: SubscriberGuard,
}

impl Subscription {
    /// Next event, or `None` once cancelled.
    pub async fn next(&mut self) -> Option<TaskEvent> {
        if let Some(message) = self.replay.pop_front() {
            return Some(TaskEvent::message(message));
        }
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            event = self.rx.recv() => event,
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = TaskEvent> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            let event = sub.next().await?;
            Some((event, sub))
        })
    }
}
