//! Deduplicating work queue with delayed re-adds.
//!
//! A key is handed to at most one worker at a time. Adding a key that is
//! already queued is a no-op; adding a key that is being processed marks it
//! dirty so it is queued once more when the worker calls [`DelayQueue::done`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

struct State<K> {
    queue: VecDeque<K>,
    /// Keys waiting to be processed, queued or deferred behind processing
    dirty: HashSet<K>,
    processing: HashSet<K>,
    /// Earliest pending delayed add per key
    waiting: HashMap<K, Instant>,
    shutting_down: bool,
}

struct Inner<K> {
    state: Mutex<State<K>>,
    /// Signalled when a key becomes available or on shutdown
    available: Notify,
    /// Signalled when the processing set empties
    idle: Notify,
}

/// Cloneable handle to one shared queue.
pub struct DelayQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for DelayQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> Default for DelayQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> DelayQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    waiting: HashMap::new(),
                    shutting_down: false,
                }),
                available: Notify::new(),
                idle: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue `key` now. Ignored after shutdown.
    pub fn add(&self, key: K) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.available.notify_one();
    }

    /// Queue `key` once `delay` has elapsed.
    ///
    /// Several delayed adds of one key collapse into the earliest.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let ready_at = Instant::now() + delay;
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            if state.waiting.get(&key).is_some_and(|at| *at <= ready_at) {
                return;
            }
            state.waiting.insert(key.clone(), ready_at);
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(ready_at).await;
            let still_ours = {
                let mut state = queue.lock();
                match state.waiting.get(&key) {
                    Some(at) if *at == ready_at => {
                        state.waiting.remove(&key);
                        true
                    }
                    _ => false,
                }
            };
            if still_ours {
                queue.add(key);
            }
        });
    }

    /// Wait for the next key. Returns `None` once shut down and empty.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        // Pass the wakeup on so idle workers see the rest.
                        self.inner.available.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Release `key` after processing, re-queueing it if it was added meanwhile.
    pub fn done(&self, key: &K) {
        let mut state = self.lock();
        state.processing.remove(key);
        let requeue = state.dirty.contains(key);
        if requeue {
            state.queue.push_back(key.clone());
        }
        let idle = state.processing.is_empty();
        drop(state);

        if requeue {
            self.inner.available.notify_one();
        }
        if idle {
            self.inner.idle.notify_waiters();
        }
    }

    /// Stop accepting keys. Queued keys are still handed out.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.shutting_down = true;
        state.waiting.clear();
        drop(state);
        self.inner.available.notify_waiters();
    }

    /// Shut down, then wait until queued and in-flight keys are finished.
    pub async fn shutdown_with_drain(&self) {
        self.shutdown();
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.lock();
                if state.processing.is_empty() && state.queue.is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Keys ready to be handed out.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn processing(&self) -> usize {
        self.lock().processing.len()
    }
}
