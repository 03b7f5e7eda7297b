//! Work queue primitives for controller loops.
//!
//! This library provides the queueing half of a reconciliation loop:
//! something notices that a key needs attention, puts it on a queue, and a
//! pool of workers drains the queue. Key concepts:
//!
//! - **Dedup**: a key has at most one outstanding delivery. Adding a queued
//!   key is a no-op; adding a key that is being processed marks it dirty and
//!   it is redelivered once the worker calls `done`.
//! - **Delay**: `add_after` parks a key until its ready time. Only the
//!   earliest ready time per key is kept.
//! - **Backoff**: `add_rate_limited` asks a [`RateLimiter`] how long to wait
//!   before the key is retried; `forget` clears that history on success.
//!
//! # Layers
//!
//! ```text
//! RateLimitingQueue ── RateLimiter (exponential, bucket, fast/slow, max-of)
//!        │
//! DelayingQueue ────── waiting loop (tokio task, ordered by ready time)
//!        │
//!      Queue ──────── queue / dirty / processing sets behind one mutex
//! ```

mod delaying;
mod queue;
mod rate_limiter;
mod rate_limiting;

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};

pub use delaying::DelayingQueue;
pub use queue::{Queue, QueueStats};
pub use rate_limiter::{
    default_controller_rate_limiter, BucketRateLimiter, ItemExponentialFailureRateLimiter,
    ItemFastSlowRateLimiter, MaxOfRateLimiter, RateLimiter,
};
pub use rate_limiting::RateLimitingQueue;

/// Bounds for anything that can be put on a queue.
pub trait Key: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T: Clone + Eq + Hash + Debug + Send + Sync + 'static> Key for T {}

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// Queue and limiter state stays consistent across a panic in a caller
/// because every critical section is a handful of set operations.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
