//! Wires the controller, deferred deletion and scaling loops together.

use std::sync::Arc;

use groupscale_reconcile::Runner;
use groupscale_workqueue::RateLimitingQueue;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::cluster::{Node, WatchEvent};
use crate::config::Config;
use crate::controller::{ControllerResult, NodeGroupController};
use crate::deletion::{DeletionWatcher, NodeRemover};
use crate::scaler::NodeGroupScaler;

/// Queue name for nodes awaiting deletion.
pub const DELETION_QUEUE: &str = "node-deletion";

/// Queue name for groups awaiting a resize.
pub const SCALE_QUEUE: &str = "node-group-scale";

/// A running controller and its background tasks.
pub struct Service {
    controller: Arc<NodeGroupController>,
    scaler: Arc<NodeGroupScaler>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Service {
    /// Initialize `controller`, start all loops and request the configured
    /// target sizes.
    ///
    /// `node_events` must be subscribed to the managed cluster's node cache.
    pub async fn start(
        config: &Config,
        controller: NodeGroupController,
        node_events: mpsc::Receiver<WatchEvent<Node>>,
        shutdown: watch::Receiver<bool>,
    ) -> ControllerResult<Self> {
        controller.init(shutdown.clone()).await?;
        let controller = Arc::new(controller);
        let mut tasks = Vec::new();

        let deletion_queue = Arc::new(RateLimitingQueue::new(
            DELETION_QUEUE,
            config.rate_limiter(),
        ));
        let watcher = DeletionWatcher::new(
            node_events,
            controller.pending_deletions(),
            Arc::clone(&deletion_queue),
        );
        tasks.push(("deletion-watcher", tokio::spawn(watcher.run(shutdown.clone()))));

        let managed = controller.managed_cluster();
        let remover = Arc::new(NodeRemover::new(
            Arc::clone(&managed.nodes),
            Arc::clone(&managed.client),
            controller.pending_deletions(),
        ));
        let remover = Runner::new(deletion_queue, remover).with_workers(config.workers);
        tasks.push(("node-remover", tokio::spawn(remover.run(shutdown.clone()))));

        let scale_queue = Arc::new(RateLimitingQueue::new(SCALE_QUEUE, config.rate_limiter()));
        let scaler = Arc::new(NodeGroupScaler::new(
            Arc::clone(&controller),
            Arc::clone(&scale_queue),
        ));
        let runner = Runner::new(scale_queue, Arc::clone(&scaler)).with_workers(config.workers);
        tasks.push(("node-group-scaler", tokio::spawn(runner.run(shutdown.clone()))));
        tasks.push((
            "resync",
            tokio::spawn(Arc::clone(&scaler).run_resync(config.resync_interval(), shutdown)),
        ));

        for (group, size) in &config.targets {
            scaler.request_size(group, *size)?;
        }

        info!(
            workers = config.workers,
            targets = config.targets.len(),
            "Node-group controller running"
        );

        Ok(Self {
            controller,
            scaler,
            tasks,
        })
    }

    pub fn controller(&self) -> &Arc<NodeGroupController> {
        &self.controller
    }

    pub fn scaler(&self) -> &Arc<NodeGroupScaler> {
        &self.scaler
    }

    /// Wait for every task to exit. Tasks exit once shutdown is signaled.
    pub async fn join(self) {
        for (name, handle) in self.tasks {
            match handle.await {
                Ok(()) => info!(task = name, "Task stopped"),
                Err(e) => error!(task = name, error = %e, "Task panicked"),
            }
        }
    }
}
