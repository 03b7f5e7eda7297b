//! Node-group controller
//!
//! Runs the controller against an in-memory hosting and managed cluster
//! seeded with one group, then converges the groups named in
//! `GROUPSCALE_TARGETS`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use groupscale_controller::cluster::InMemoryCluster;
use groupscale_controller::{Config, NodeGroupController, Service};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Node event buffer between the node cache and the deletion watcher.
const NODE_EVENT_BUFFER: usize = 256;

/// How long to wait for tasks after shutdown is signaled.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        namespace = %config.namespace,
        group_label = %config.group_label,
        workers = config.workers,
        "Starting node-group controller"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Seed the in-memory cluster so a member template exists
    let cluster = Arc::new(InMemoryCluster::new(&config.namespace, &config.group_label));
    for i in 0..config.seed_members {
        let controller = format!("{}-seed-{i}", config.seed_group);
        cluster.seed_member(&config.seed_group, &controller).await?;
    }
    cluster.mark_synced();
    let node_events = cluster.nodes().subscribe(NODE_EVENT_BUFFER);

    let controller = NodeGroupController::new(
        cluster.hosting(),
        cluster.managed(),
        config.controller_settings(),
    );

    let service = match Service::start(&config, controller, node_events, shutdown_rx).await {
        Ok(service) => service,
        Err(e) => {
            error!(error = %e, fatal = e.is_fatal(), "Failed to start node-group controller");
            return Err(e.into());
        }
    };

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    if tokio::time::timeout(SHUTDOWN_GRACE, service.join()).await.is_err() {
        warn!("Timed out waiting for workers");
    }

    info!("Node-group controller shutdown complete");
    Ok(())
}
