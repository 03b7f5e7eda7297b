//! Worker pool draining a rate-limited queue.

use std::sync::Arc;

use async_trait::async_trait;
use groupscale_workqueue::{Key, RateLimitingQueue};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{ReconcileError, DEFAULT_WORKERS};

/// Converges the state identified by one key.
#[async_trait]
pub trait Reconcile<K>: Send + Sync + 'static {
    /// Name for logging.
    fn name(&self) -> &str;

    /// Reconcile `key`. Transient errors requeue the key with backoff.
    async fn reconcile(&self, key: &K) -> Result<(), ReconcileError>;
}

/// Runs a pool of workers that feed queued keys to a reconciler.
pub struct Runner<K: Key, R> {
    queue: Arc<RateLimitingQueue<K>>,
    reconciler: Arc<R>,
    workers: usize,
    max_requeues: Option<u32>,
}

impl<K: Key, R: Reconcile<K>> Runner<K, R> {
    /// Create a runner with the default worker count and unlimited requeues.
    pub fn new(queue: Arc<RateLimitingQueue<K>>, reconciler: Arc<R>) -> Self {
        Self {
            queue,
            reconciler,
            workers: DEFAULT_WORKERS,
            max_requeues: None,
        }
    }

    /// Set the number of workers (at least one).
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Drop a key after it has been requeued this many times in a row.
    pub fn with_max_requeues(mut self, max_requeues: u32) -> Self {
        self.max_requeues = Some(max_requeues);
        self
    }

    /// Run until shutdown is signaled, then shut the queue down and wait for
    /// in-flight keys to finish.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            reconciler = %self.reconciler.name(),
            queue = %self.queue.name(),
            workers = self.workers,
            "Starting workers"
        );

        let mut handles = Vec::with_capacity(self.workers);
        for worker in 0..self.workers {
            let queue = Arc::clone(&self.queue);
            let reconciler = Arc::clone(&self.reconciler);
            let max_requeues = self.max_requeues;
            handles.push(tokio::spawn(async move {
                while process_next(&queue, reconciler.as_ref(), max_requeues).await {}
                debug!(worker, queue = %queue.name(), "Worker exiting");
            }));
        }

        loop {
            if *shutdown.borrow() {
                break;
            }
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        info!(reconciler = %self.reconciler.name(), "Shutting down workers");
        self.queue.shut_down();

        for handle in handles {
            if let Err(e) = handle.await {
                error!(reconciler = %self.reconciler.name(), error = %e, "Worker task panicked");
            }
        }

        info!(reconciler = %self.reconciler.name(), "Workers stopped");
    }
}

/// Take one key off the queue and reconcile it.
///
/// Returns `false` once the queue is shut down and empty.
pub async fn process_next<K, R>(
    queue: &RateLimitingQueue<K>,
    reconciler: &R,
    max_requeues: Option<u32>,
) -> bool
where
    K: Key,
    R: Reconcile<K> + ?Sized,
{
    let Some(key) = queue.get().await else {
        return false;
    };

    match reconciler.reconcile(&key).await {
        Ok(()) => {
            queue.forget(&key);
        }
        Err(e) if e.is_transient() => {
            let requeues = queue.num_requeues(&key);
            if max_requeues.is_some_and(|max| requeues >= max) {
                error!(
                    reconciler = %reconciler.name(),
                    ?key,
                    requeues,
                    error = %e,
                    "Dropping key after too many retries"
                );
                queue.forget(&key);
            } else {
                warn!(
                    reconciler = %reconciler.name(),
                    ?key,
                    requeues,
                    error = %e,
                    "Reconcile failed, requeueing"
                );
                queue.add_rate_limited(key.clone());
            }
        }
        Err(e) => {
            error!(
                reconciler = %reconciler.name(),
                ?key,
                error = %e,
                "Reconcile failed permanently, dropping key"
            );
            queue.forget(&key);
        }
    }

    queue.done(&key);
    true
}
