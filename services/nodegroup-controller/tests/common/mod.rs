//! Shared fixtures for controller integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use groupscale_controller::cluster::{InMemoryCluster, Lister, Selector};
use groupscale_controller::{ControllerSettings, NodeGroupController};
use groupscale_naming::SequentialNames;
use tokio::sync::watch;

pub const NAMESPACE: &str = "kubemark";
pub const GROUP_LABEL: &str = "autoscaling.k8s.io/nodegroup";

/// Cluster with `count` running members per group, named `{group}-seed-{i}`.
pub async fn cluster_with(groups: &[(&str, usize)]) -> Arc<InMemoryCluster> {
    let cluster = Arc::new(InMemoryCluster::new(NAMESPACE, GROUP_LABEL));
    for (group, count) in groups {
        for i in 0..*count {
            cluster
                .seed_member(group, &format!("{group}-seed-{i}"))
                .await
                .unwrap();
        }
    }
    cluster.mark_synced();
    cluster
}

/// Uninitialized controller with sequential member names.
pub fn controller(cluster: &Arc<InMemoryCluster>) -> NodeGroupController {
    NodeGroupController::new(cluster.hosting(), cluster.managed(), ControllerSettings::default())
        .with_name_generator(Arc::new(SequentialNames::new()))
}

/// Controller that has captured its member template.
pub async fn initialized_controller(cluster: &Arc<InMemoryCluster>) -> NodeGroupController {
    let controller = controller(cluster);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    controller.init(shutdown_rx).await.unwrap();
    controller
}

pub fn node_count(cluster: &InMemoryCluster) -> usize {
    cluster.nodes().list(&Selector::everything()).unwrap().len()
}

/// Poll `condition` until it holds, panicking after `within`.
pub async fn eventually(within: Duration, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + within;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {within:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
