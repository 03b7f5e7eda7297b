//! Local caches of cluster objects.
//!
//! An [`Informer`] holds the latest known copy of every object of one kind
//! and publishes a [`WatchEvent`] to each subscriber when an object changes.
//! Subscribers receive events on a bounded channel and handle them on their
//! own task, so no callback ever runs inside the cache.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::error::ClusterError;
use super::types::{Object, Selector};

/// How often cache sync is polled while starting up.
pub const CACHE_SYNC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Read access to a cache.
pub trait Lister<T: Object>: Send + Sync {
    /// List objects whose labels match `selector`.
    fn list(&self, selector: &Selector) -> Result<Vec<T>, ClusterError>;

    /// Look up an object by name.
    fn get(&self, name: &str) -> Result<Option<T>, ClusterError>;

    /// Returns true once the initial listing has completed.
    fn has_synced(&self) -> bool;
}

/// A change to a cached object.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<T> {
    Added(T),
    Modified { old: T, new: T },
    Deleted(T),
}

/// Cache of one object kind with change notification.
pub struct Informer<T: Object> {
    name: String,
    items: RwLock<BTreeMap<String, T>>,
    synced: AtomicBool,
    subscribers: Mutex<Vec<mpsc::Sender<WatchEvent<T>>>>,
}

impl<T: Object> Informer<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: RwLock::new(BTreeMap::new()),
            synced: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a subscriber. Events are buffered up to `capacity`; a full
    /// buffer makes the cache wait for the subscriber.
    pub fn subscribe(&self, capacity: usize) -> mpsc::Receiver<WatchEvent<T>> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Replace the cache contents with a full listing and mark it synced.
    ///
    /// No events are published for a replace.
    pub fn replace(&self, items: impl IntoIterator<Item = T>) {
        let items: BTreeMap<_, _> = items
            .into_iter()
            .map(|item| (item.name().to_string(), item))
            .collect();
        let count = items.len();
        *self.items.write().unwrap_or_else(PoisonError::into_inner) = items;
        self.mark_synced();
        debug!(cache = %self.name, count, "Cache replaced");
    }

    /// Mark the initial listing as complete.
    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::SeqCst);
    }

    /// Insert or update an object and notify subscribers.
    pub async fn upsert(&self, item: T) {
        let previous = self
            .items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(item.name().to_string(), item.clone());

        let event = match previous {
            Some(old) => WatchEvent::Modified { old, new: item },
            None => WatchEvent::Added(item),
        };
        self.publish(event).await;
    }

    /// Remove an object and notify subscribers. Returns the removed object.
    pub async fn remove(&self, name: &str) -> Option<T> {
        let removed = self
            .items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);

        if let Some(item) = &removed {
            self.publish(WatchEvent::Deleted(item.clone())).await;
        }
        removed
    }

    async fn publish(&self, event: WatchEvent<T>) {
        let subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut closed = false;
        for tx in &subscribers {
            if tx.send(event.clone()).await.is_err() {
                closed = true;
            }
        }

        if closed {
            self.subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|tx| !tx.is_closed());
            debug!(cache = %self.name, "Dropped closed subscribers");
        }
    }
}

impl<T: Object> Lister<T> for Informer<T> {
    fn list(&self, selector: &Selector) -> Result<Vec<T>, ClusterError> {
        let items = self.items.read().unwrap_or_else(PoisonError::into_inner);
        Ok(items
            .values()
            .filter(|item| selector.matches(&item.meta().labels))
            .cloned()
            .collect())
    }

    fn get(&self, name: &str) -> Result<Option<T>, ClusterError> {
        let items = self.items.read().unwrap_or_else(PoisonError::into_inner);
        Ok(items.get(name).cloned())
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}

/// Poll `synced` until it returns true or shutdown is signaled.
///
/// Returns false if shutdown was signaled (or its sender dropped) first.
pub async fn wait_for_cache_sync<F>(
    controller: &str,
    shutdown: &mut watch::Receiver<bool>,
    synced: F,
) -> bool
where
    F: Fn() -> bool,
{
    info!(controller, "Waiting for caches to sync");
    let mut poll = tokio::time::interval(CACHE_SYNC_POLL_INTERVAL);

    loop {
        if *shutdown.borrow() {
            warn!(controller, "Cache sync cancelled");
            return false;
        }

        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() {
                    warn!(controller, "Shutdown channel closed during cache sync");
                    return false;
                }
            }

            _ = poll.tick() => {
                if synced() {
                    info!(controller, "Caches synced");
                    return true;
                }
            }
        }
    }
}
