//! Queue with delayed adds.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::debug;

use crate::queue::{Queue, QueueStats};
use crate::Key;

/// Used when a delay is too large to represent as an instant.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365);

/// A [`Queue`] that can also hold keys back until a ready time.
///
/// Delayed keys are owned by a background task that adds each key to the
/// queue when its time comes. Creating a `DelayingQueue` therefore requires a
/// running Tokio runtime. The task stops on `shut_down` or when the queue is
/// dropped.
pub struct DelayingQueue<K: Key> {
    queue: Arc<Queue<K>>,
    waiting_tx: mpsc::UnboundedSender<(K, Instant)>,
    stop_tx: watch::Sender<bool>,
}

impl<K: Key> DelayingQueue<K> {
    /// Create a queue and spawn its waiting loop.
    pub fn new(name: impl Into<String>) -> Self {
        let queue = Arc::new(Queue::new(name));
        let (waiting_tx, waiting_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        tokio::spawn(run_waiting_loop(Arc::clone(&queue), waiting_rx, stop_rx));

        Self {
            queue,
            waiting_tx,
            stop_tx,
        }
    }

    /// Add `item` once `delay` has elapsed. A zero delay adds immediately.
    pub fn add_after(&self, item: K, delay: Duration) {
        if self.queue.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.queue.add(item);
            return;
        }

        let now = Instant::now();
        let ready_at = now
            .checked_add(delay)
            .unwrap_or_else(|| now + FAR_FUTURE);

        if self.waiting_tx.send((item, ready_at)).is_err() {
            debug!(queue = %self.queue.name(), "Waiting loop stopped, dropping delayed add");
        }
    }

    /// See [`Queue::add`].
    pub fn add(&self, item: K) {
        self.queue.add(item);
    }

    /// See [`Queue::get`].
    pub async fn get(&self) -> Option<K> {
        self.queue.get().await
    }

    /// See [`Queue::done`].
    pub fn done(&self, item: &K) {
        self.queue.done(item);
    }

    /// Shut down the queue and stop the waiting loop. Keys still waiting for
    /// their ready time are discarded.
    pub fn shut_down(&self) {
        self.queue.shut_down();
        let _ = self.stop_tx.send(true);
    }

    /// See [`Queue::is_shutting_down`].
    pub fn is_shutting_down(&self) -> bool {
        self.queue.is_shutting_down()
    }

    /// See [`Queue::len`].
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// See [`Queue::is_empty`].
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// See [`Queue::name`].
    pub fn name(&self) -> &str {
        self.queue.name()
    }

    /// See [`Queue::stats`].
    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub(crate) fn record_retry(&self) {
        self.queue.record_retry();
    }
}

/// Keys waiting for their ready time, earliest first.
struct Waiting<K> {
    timeline: BTreeMap<(Instant, u64), K>,
    index: HashMap<K, (Instant, u64)>,
    seq: u64,
}

impl<K: Key> Waiting<K> {
    fn new() -> Self {
        Self {
            timeline: BTreeMap::new(),
            index: HashMap::new(),
            seq: 0,
        }
    }

    /// Track `item`, keeping only its earliest ready time.
    fn insert(&mut self, item: K, ready_at: Instant) {
        if let Some(&existing) = self.index.get(&item) {
            if existing.0 <= ready_at {
                return;
            }
            self.timeline.remove(&existing);
        }

        self.seq += 1;
        let slot = (ready_at, self.seq);
        self.timeline.insert(slot, item.clone());
        self.index.insert(item, slot);
    }

    fn pop_ready(&mut self, now: Instant) -> Vec<K> {
        let mut ready = Vec::new();
        while let Some(entry) = self.timeline.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let item = entry.remove();
            self.index.remove(&item);
            ready.push(item);
        }
        ready
    }

    fn next_ready_at(&self) -> Option<Instant> {
        self.timeline.keys().next().map(|(at, _)| *at)
    }

    fn len(&self) -> usize {
        self.timeline.len()
    }
}

async fn run_waiting_loop<K: Key>(
    queue: Arc<Queue<K>>,
    mut waiting_rx: mpsc::UnboundedReceiver<(K, Instant)>,
    mut stop: watch::Receiver<bool>,
) {
    let mut waiting = Waiting::new();

    loop {
        if queue.is_shutting_down() {
            break;
        }

        for item in waiting.pop_ready(Instant::now()) {
            queue.add(item);
        }

        let next = waiting.next_ready_at();
        let sleep = async move {
            match next {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;

            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }

            msg = waiting_rx.recv() => {
                match msg {
                    Some((item, ready_at)) => {
                        if ready_at <= Instant::now() {
                            queue.add(item);
                        } else {
                            waiting.insert(item, ready_at);
                        }
                    }
                    None => break,
                }
            }

            _ = sleep => {}
        }
    }

    debug!(
        queue = %queue.name(),
        discarded = waiting.len(),
        "Delaying loop stopped"
    );
}
