//! Deferred node deletion.
//!
//! Removing a member deletes its backing controller right away, but the node
//! object it registered lingers until the node stops reporting Ready. The
//! member is marked in a [`PendingDeletionSet`]; the [`DeletionWatcher`]
//! queues marked nodes as they turn not-ready, and the [`NodeRemover`]
//! deletes them.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use groupscale_reconcile::{Reconcile, ReconcileError};
use groupscale_workqueue::RateLimitingQueue;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::cluster::{ClusterError, DeleteOptions, Lister, Node, NodeClient, Object, WatchEvent};

/// Names of members whose node is waiting to be deleted.
#[derive(Debug, Default)]
pub struct PendingDeletionSet {
    members: Mutex<HashSet<String>>,
}

impl PendingDeletionSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mark(&self, member: &str) {
        self.lock().insert(member.to_string());
    }

    pub fn is_marked(&self, member: &str) -> bool {
        self.lock().contains(member)
    }

    /// Clear the mark for `member`. Returns true if it was marked.
    pub fn take(&self, member: &str) -> bool {
        self.lock().remove(member)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Queues marked nodes when they stop reporting Ready.
pub struct DeletionWatcher {
    events: mpsc::Receiver<WatchEvent<Node>>,
    pending: Arc<PendingDeletionSet>,
    queue: Arc<RateLimitingQueue<String>>,
}

impl DeletionWatcher {
    pub fn new(
        events: mpsc::Receiver<WatchEvent<Node>>,
        pending: Arc<PendingDeletionSet>,
        queue: Arc<RateLimitingQueue<String>>,
    ) -> Self {
        Self {
            events,
            pending,
            queue,
        }
    }

    /// Handle node events until shutdown or until the event stream closes.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(queue = %self.queue.name(), "Deletion watcher started");

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Deletion watcher shutting down");
                        break;
                    }
                }

                event = self.events.recv() => {
                    match event {
                        Some(event) => self.handle(event),
                        None => {
                            warn!("Node event stream closed");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Only updates matter: a node is queued on the update that shows it
    /// not ready while it is marked.
    pub fn handle(&self, event: WatchEvent<Node>) {
        let WatchEvent::Modified { new: node, .. } = event else {
            return;
        };

        if node.is_not_ready() && self.pending.is_marked(node.name()) {
            debug!(node = %node.name(), "Marked node is not ready, queueing deletion");
            self.queue.add(node.name().to_string());
        }
    }
}

/// Deletes queued nodes that are still marked and not ready.
pub struct NodeRemover {
    nodes: Arc<dyn Lister<Node>>,
    client: Arc<dyn NodeClient>,
    pending: Arc<PendingDeletionSet>,
}

impl NodeRemover {
    pub fn new(
        nodes: Arc<dyn Lister<Node>>,
        client: Arc<dyn NodeClient>,
        pending: Arc<PendingDeletionSet>,
    ) -> Self {
        Self {
            nodes,
            client,
            pending,
        }
    }
}

#[async_trait]
impl Reconcile<String> for NodeRemover {
    fn name(&self) -> &str {
        "node-remover"
    }

    async fn reconcile(&self, name: &String) -> Result<(), ReconcileError> {
        let node = match self.nodes.get(name) {
            Ok(Some(node)) => node,
            Ok(None) => {
                if self.pending.take(name) {
                    debug!(node = %name, "Node already gone, clearing mark");
                }
                return Ok(());
            }
            Err(e) => return Err(ReconcileError::Transient(e.to_string())),
        };

        if !node.is_not_ready() {
            debug!(node = %name, "Node is ready again, skipping");
            return Ok(());
        }

        // Taking the mark makes concurrent deliveries for the same node no-ops.
        if !self.pending.take(name) {
            return Ok(());
        }

        match self.client.delete_node(name, &DeleteOptions::default()).await {
            Ok(()) => {
                info!(node = %name, "Deleted node of removed member");
                Ok(())
            }
            Err(ClusterError::NotFound { .. }) => {
                debug!(node = %name, "Node already deleted");
                Ok(())
            }
            Err(e) => {
                self.pending.mark(name);
                Err(ReconcileError::Transient(format!(
                    "deleting node {name}: {e}"
                )))
            }
        }
    }
}
