//! Deduplicating FIFO queue.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::debug;

use crate::{lock, Key};

/// Point-in-time counters for a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    /// Keys waiting to be handed to a worker.
    pub depth: usize,

    /// Keys currently held by workers.
    pub in_flight: usize,

    /// Adds that resulted in a newly dirty key.
    pub adds: u64,

    /// Rate-limited requeues.
    pub retries: u64,
}

struct State<K> {
    /// Keys ready for delivery, in order.
    queue: VecDeque<K>,

    /// Keys that need processing (queued, or re-added while processing).
    dirty: HashSet<K>,

    /// Keys currently held by a worker.
    processing: HashSet<K>,

    shutting_down: bool,
}

/// A work queue where each key has at most one outstanding delivery.
///
/// Key states:
///
/// ```text
/// absent ──add──▶ queued ──get──▶ processing ──done──▶ absent
///                                     │  ▲
///                                    add done (requeue)
///                                     ▼  │
///                               processing + dirty
/// ```
pub struct Queue<K> {
    name: String,
    state: Mutex<State<K>>,
    notify: Notify,
    adds: AtomicU64,
    retries: AtomicU64,
}

impl<K: Key> Queue<K> {
    /// Create an empty queue.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            adds: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    /// Queue name, used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mark `item` as needing processing.
    pub fn add(&self, item: K) {
        {
            let mut state = lock(&self.state);
            if state.shutting_down {
                return;
            }
            if !state.dirty.insert(item.clone()) {
                return;
            }
            self.adds.fetch_add(1, Ordering::Relaxed);
            if state.processing.contains(&item) {
                debug!(queue = %self.name, ?item, "Key is in flight, will redeliver after done");
                return;
            }
            state.queue.push_back(item);
        }
        self.notify.notify_one();
    }

    /// Wait for the next key.
    ///
    /// Returns `None` once the queue has been shut down and drained.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting state so a shutdown in between is not lost.
            notified.as_mut().enable();

            {
                let mut state = lock(&self.state);
                if let Some(item) = state.queue.pop_front() {
                    state.processing.insert(item.clone());
                    state.dirty.remove(&item);
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark `item` as finished. A key re-added while in flight is requeued.
    pub fn done(&self, item: &K) {
        {
            let mut state = lock(&self.state);
            state.processing.remove(item);
            if !state.dirty.contains(item) {
                return;
            }
            state.queue.push_back(item.clone());
        }
        self.notify.notify_one();
    }

    /// Stop accepting keys and wake every waiting `get`.
    pub fn shut_down(&self) {
        {
            let mut state = lock(&self.state);
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
        }
        debug!(queue = %self.name, "Queue shutting down");
        self.notify.notify_waiters();
    }

    /// Whether `shut_down` has been called.
    pub fn is_shutting_down(&self) -> bool {
        lock(&self.state).shutting_down
    }

    /// Number of keys waiting for delivery.
    pub fn len(&self) -> usize {
        lock(&self.state).queue.len()
    }

    /// Whether no keys are waiting for delivery.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the queue counters.
    pub fn stats(&self) -> QueueStats {
        let state = lock(&self.state);
        QueueStats {
            depth: state.queue.len(),
            in_flight: state.processing.len(),
            adds: self.adds.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }
}
