//! Target-size driven scaling.
//!
//! Callers record a target size per group; the group name is queued and a
//! worker converges the group through [`NodeGroupController`]. Failed groups
//! are requeued with backoff, and every known group is requeued on a fixed
//! interval so drift is corrected.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use groupscale_naming::GroupName;
use groupscale_reconcile::{Reconcile, ReconcileError};
use groupscale_workqueue::RateLimitingQueue;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::controller::{ControllerResult, NodeGroupController};

/// Holds target sizes and converges groups towards them.
pub struct NodeGroupScaler {
    controller: Arc<NodeGroupController>,
    targets: Mutex<HashMap<String, usize>>,
    queue: Arc<RateLimitingQueue<String>>,
}

impl NodeGroupScaler {
    pub fn new(controller: Arc<NodeGroupController>, queue: Arc<RateLimitingQueue<String>>) -> Self {
        Self {
            controller,
            targets: Mutex::new(HashMap::new()),
            queue,
        }
    }

    fn targets(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        self.targets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the target size for `group` and queue it.
    pub fn request_size(&self, group: &str, size: usize) -> ControllerResult<()> {
        let group = GroupName::parse(group)?.into_string();
        self.targets().insert(group.clone(), size);
        debug!(group = %group, size, "Target size recorded");
        self.queue.add(group);
        Ok(())
    }

    /// Current target for `group`, if one was requested.
    pub fn target(&self, group: &str) -> Option<usize> {
        self.targets().get(group).copied()
    }

    /// Groups with a recorded target, sorted.
    pub fn groups(&self) -> Vec<String> {
        let mut groups: Vec<_> = self.targets().keys().cloned().collect();
        groups.sort();
        groups
    }

    /// Queue every group with a recorded target.
    pub fn resync(&self) {
        let groups = self.groups();
        debug!(count = groups.len(), "Resyncing node groups");
        for group in groups {
            self.queue.add(group);
        }
    }

    /// Call [`Self::resync`] every `interval` until shutdown.
    pub async fn run_resync(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "Starting resync loop");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; targets are queued on request.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Resync loop shutting down");
                        break;
                    }
                }

                _ = ticker.tick() => self.resync(),
            }
        }
    }
}

#[async_trait]
impl Reconcile<String> for NodeGroupScaler {
    fn name(&self) -> &str {
        "node-group-scaler"
    }

    async fn reconcile(&self, group: &String) -> Result<(), ReconcileError> {
        let Some(target) = self.target(group) else {
            return Ok(());
        };

        match self.controller.set_node_group_size(group, target).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_transient() => Err(ReconcileError::Transient(e.to_string())),
            Err(e) => Err(ReconcileError::Permanent(e.to_string())),
        }
    }
}
