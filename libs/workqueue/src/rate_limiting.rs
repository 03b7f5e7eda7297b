//! Queue with rate-limited requeue.

use std::time::Duration;

use tracing::debug;

use crate::delaying::DelayingQueue;
use crate::queue::QueueStats;
use crate::rate_limiter::{default_controller_rate_limiter, RateLimiter};
use crate::Key;

/// A [`DelayingQueue`] that asks a [`RateLimiter`] how long failed keys wait.
pub struct RateLimitingQueue<K: Key> {
    delaying: DelayingQueue<K>,
    limiter: Box<dyn RateLimiter<K>>,
}

impl<K: Key> RateLimitingQueue<K> {
    /// Create a queue backed by `limiter`. Requires a running Tokio runtime.
    pub fn new(name: impl Into<String>, limiter: impl RateLimiter<K> + 'static) -> Self {
        Self {
            delaying: DelayingQueue::new(name),
            limiter: Box::new(limiter),
        }
    }

    /// Create a queue with [`default_controller_rate_limiter`].
    pub fn with_default_limiter(name: impl Into<String>) -> Self {
        Self::new(name, default_controller_rate_limiter())
    }

    /// Requeue `item` after the limiter's delay for it.
    pub fn add_rate_limited(&self, item: K) {
        let delay = self.limiter.when(&item);
        self.delaying.record_retry();
        debug!(
            queue = %self.delaying.name(),
            ?item,
            delay_ms = delay.as_millis() as u64,
            "Requeueing with backoff"
        );
        self.delaying.add_after(item, delay);
    }

    /// Clear the limiter's history for `item`. Does not remove it from the queue.
    pub fn forget(&self, item: &K) {
        self.limiter.forget(item);
    }

    /// Consecutive failures recorded for `item`.
    pub fn num_requeues(&self, item: &K) -> u32 {
        self.limiter.num_requeues(item)
    }

    /// See [`DelayingQueue::add_after`].
    pub fn add_after(&self, item: K, delay: Duration) {
        self.delaying.add_after(item, delay);
    }

    /// See [`DelayingQueue::add`].
    pub fn add(&self, item: K) {
        self.delaying.add(item);
    }

    /// See [`DelayingQueue::get`].
    pub async fn get(&self) -> Option<K> {
        self.delaying.get().await
    }

    /// See [`DelayingQueue::done`].
    pub fn done(&self, item: &K) {
        self.delaying.done(item);
    }

    /// See [`DelayingQueue::shut_down`].
    pub fn shut_down(&self) {
        self.delaying.shut_down();
    }

    /// See [`DelayingQueue::is_shutting_down`].
    pub fn is_shutting_down(&self) -> bool {
        self.delaying.is_shutting_down()
    }

    /// See [`DelayingQueue::len`].
    pub fn len(&self) -> usize {
        self.delaying.len()
    }

    /// See [`DelayingQueue::is_empty`].
    pub fn is_empty(&self) -> bool {
        self.delaying.is_empty()
    }

    /// See [`DelayingQueue::name`].
    pub fn name(&self) -> &str {
        self.delaying.name()
    }

    /// See [`DelayingQueue::stats`].
    pub fn stats(&self) -> QueueStats {
        self.delaying.stats()
    }
}
