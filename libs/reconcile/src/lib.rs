//! Reconciliation loop primitives.
//!
//! This library provides helpers for implementing reconciliation loops
//! that converge desired state to current state. Key concepts:
//!
//! - **Desired state**: What the system should look like (a target size).
//! - **Current state**: What the system actually looks like (from caches).
//! - **Convergence**: The process of making current match desired.
//!
//! Two retry policies live side by side and are chosen per call site:
//!
//! - [`RetryPolicy`]: a fixed number of immediate attempts for a single
//!   external call, with no delay in between.
//! - [`Runner`]: a worker pool over a rate-limited queue, where a failed key
//!   is requeued with per-key backoff.
//!
//! # Invariants
//!
//! - All operations are idempotent
//! - A key is never reconciled by two workers at once
//! - Success clears a key's backoff history

mod runner;

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

pub use runner::{process_next, Reconcile, Runner};

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Failure that may succeed later; the key is retried with backoff.
    #[error("transient error: {0}")]
    Transient(String),

    /// Failure that will not resolve by retrying; the key is dropped.
    #[error("permanent error: {0}")]
    Permanent(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ReconcileError {
    /// Returns true if the key should be requeued with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Immediate, fixed-count retry for a single external call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    /// Create a policy making at most `attempts` calls (at least one).
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
        }
    }

    /// Maximum number of calls.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Run `op` until it succeeds or the attempts are used up.
    ///
    /// `op` receives the 1-based attempt number. The last error is returned.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.run_if(operation, |_| true, op).await
    }

    /// Like [`Self::run`], but only errors accepted by `retryable` are
    /// retried. Any other error is returned at once.
    pub async fn run_if<T, E, F, Fut, P>(
        &self,
        operation: &str,
        retryable: P,
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if !retryable(&e) => {
                    warn!(operation, attempt, error = %e, "Attempt failed, not retrying");
                    return Err(e);
                }
                Err(e) if attempt < self.attempts => {
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.attempts,
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    attempt += 1;
                }
                Err(e) => {
                    warn!(
                        operation,
                        attempts = self.attempts,
                        error = %e,
                        "All attempts failed"
                    );
                    return Err(e);
                }
            }
        }
    }
}

/// Drain selection priority for group members.
///
/// Lower priority values are drained first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DrainPriority {
    /// Member has no registered node (drain first).
    Failed = 0,

    /// Member's node is not ready.
    NotReady = 1,

    /// Member is healthy (drain last).
    Healthy = 2,
}

/// Order members for draining.
///
/// Returns members sorted by drain priority (first to drain first). The sort
/// is stable, so members of equal priority keep their input order.
pub fn select_for_drain<T, F>(members: Vec<T>, get_priority: F) -> Vec<T>
where
    F: Fn(&T) -> DrainPriority,
{
    let mut with_priority: Vec<_> = members
        .into_iter()
        .map(|m| {
            let p = get_priority(&m);
            (p, m)
        })
        .collect();

    with_priority.sort_by_key(|(p, _)| *p);
    with_priority.into_iter().map(|(_, m)| m).collect()
}

/// Default resync interval for control loops.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Default number of immediate attempts per external call.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default number of workers per queue.
pub const DEFAULT_WORKERS: usize = 2;
