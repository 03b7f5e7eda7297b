//! Integration tests for growing and shrinking node groups.
//!
//! Runs the controller against the in-memory cluster and checks the calls it
//! makes.

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{cluster_with, controller, initialized_controller, GROUP_LABEL, NAMESPACE};
use groupscale_controller::cluster::{
    BackingController, ClusterCall, ClusterError, ConditionStatus, ControllerClient,
    DeleteOptions, InMemoryCluster, PropagationPolicy,
};
use groupscale_controller::{ControllerError, ControllerSettings, NodeGroupController};
use groupscale_naming::SequentialNames;
use tokio::sync::watch;

/// Client whose first create and first delete are applied but answered with
/// an error, as when a response is lost after the server committed the call.
struct LostResponses {
    inner: Arc<InMemoryCluster>,
    creates: AtomicU32,
    deletes: AtomicU32,
}

impl LostResponses {
    fn new(inner: Arc<InMemoryCluster>) -> Self {
        Self {
            inner,
            creates: AtomicU32::new(1),
            deletes: AtomicU32::new(1),
        }
    }
}

fn lose(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl ControllerClient for LostResponses {
    async fn create_controller(
        &self,
        controller: &BackingController,
    ) -> Result<BackingController, ClusterError> {
        let created = self.inner.create_controller(controller).await?;
        if lose(&self.creates) {
            return Err(ClusterError::Unavailable("connection reset".into()));
        }
        Ok(created)
    }

    async fn delete_controller(
        &self,
        namespace: &str,
        name: &str,
        options: &DeleteOptions,
    ) -> Result<(), ClusterError> {
        self.inner.delete_controller(namespace, name, options).await?;
        if lose(&self.deletes) {
            return Err(ClusterError::Unavailable("connection reset".into()));
        }
        Ok(())
    }

    async fn get_controller(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BackingController, ClusterError> {
        self.inner.get_controller(namespace, name).await
    }
}

async fn controller_with_lost_responses(cluster: &Arc<InMemoryCluster>) -> NodeGroupController {
    let mut hosting = cluster.hosting();
    hosting.client = Arc::new(LostResponses::new(Arc::clone(cluster)));
    let controller =
        NodeGroupController::new(hosting, cluster.managed(), ControllerSettings::default())
            .with_name_generator(Arc::new(SequentialNames::new()));
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    controller.init(shutdown_rx).await.unwrap();
    controller
}

#[tokio::test]
async fn test_scale_up_creates_missing_members() {
    let cluster = cluster_with(&[("pool-a", 2)]).await;
    let controller = initialized_controller(&cluster).await;

    controller.set_node_group_size("pool-a", 5).await.unwrap();

    let creates = cluster.create_calls();
    assert_eq!(creates.len(), 3);

    let mut names = HashSet::new();
    for call in &creates {
        let ClusterCall::CreateController { name, labels } = call else {
            unreachable!();
        };
        assert!(names.insert(name.clone()), "duplicate member name {name}");
        assert_eq!(labels.get(GROUP_LABEL).map(String::as_str), Some("pool-a"));
        assert_eq!(labels.get("name"), Some(name));
    }

    assert_eq!(controller.get_node_group_size("pool-a").unwrap(), 5);
    assert_eq!(controller.get_node_names_for_nodegroup("pool-a").unwrap().len(), 5);
}

#[tokio::test]
async fn test_new_members_copy_template_spec() {
    let cluster = cluster_with(&[("pool-a", 1)]).await;
    let controller = initialized_controller(&cluster).await;

    controller.set_node_group_size("pool-a", 2).await.unwrap();

    let seed = cluster
        .get_controller(NAMESPACE, "pool-a-seed-0")
        .await
        .unwrap();
    let created = cluster.get_controller(NAMESPACE, "pool-a-0").await.unwrap();

    assert_eq!(created.template.spec, seed.template.spec);
    assert_eq!(created.meta.namespace, NAMESPACE);
    assert_eq!(created.replicas, 1);
}

#[tokio::test]
async fn test_equal_size_is_noop() {
    let cluster = cluster_with(&[("pool-a", 3)]).await;
    let controller = initialized_controller(&cluster).await;

    controller.set_node_group_size("pool-a", 3).await.unwrap();

    assert!(cluster.calls().is_empty());
}

#[tokio::test]
async fn test_groups_are_independent() {
    let cluster = cluster_with(&[("pool-a", 2), ("pool-b", 1)]).await;
    let controller = initialized_controller(&cluster).await;

    controller.set_node_group_size("pool-b", 3).await.unwrap();

    assert_eq!(controller.get_node_group_size("pool-a").unwrap(), 2);
    assert_eq!(controller.get_node_group_size("pool-b").unwrap(), 3);
    assert_eq!(controller.get_node_group_size("pool-c").unwrap(), 0);
    assert!(controller
        .get_node_names_for_nodegroup("pool-a")
        .unwrap()
        .iter()
        .all(|name| name.starts_with("pool-a-")));
}

#[tokio::test]
async fn test_create_is_retried() {
    let cluster = cluster_with(&[("pool-a", 1)]).await;
    let controller = initialized_controller(&cluster).await;
    cluster.fail_next_creates(2);

    controller.set_node_group_size("pool-a", 2).await.unwrap();

    let creates = cluster.create_calls();
    assert_eq!(creates.len(), 3);
    assert!(creates.windows(2).all(|w| w[0] == w[1]), "retries reuse the member name");
    assert_eq!(controller.get_node_group_size("pool-a").unwrap(), 2);
}

#[tokio::test]
async fn test_create_gives_up_after_three_attempts() {
    let cluster = cluster_with(&[("pool-a", 1)]).await;
    let controller = initialized_controller(&cluster).await;
    cluster.fail_next_creates(3);

    let err = controller.set_node_group_size("pool-a", 3).await.unwrap_err();

    assert!(matches!(err, ControllerError::CreateFailed { .. }));
    assert!(err.is_transient());
    assert_eq!(cluster.create_calls().len(), 3);
    assert_eq!(controller.get_node_group_size("pool-a").unwrap(), 1);
}

#[tokio::test]
async fn test_scale_down_rejects_insufficient_members() {
    let cluster = cluster_with(&[("pool-a", 3)]).await;
    let controller = initialized_controller(&cluster).await;

    // Two pods vanish while their controllers remain.
    cluster.pods().remove("pool-a-seed-0-0").await;
    cluster.pods().remove("pool-a-seed-1-0").await;

    let err = controller.set_node_group_size("pool-a", 0).await.unwrap_err();

    assert!(matches!(
        err,
        ControllerError::InsufficientMembers {
            requested: 3,
            available: 1,
            ..
        }
    ));
    assert!(!err.is_transient());
    assert!(cluster.controller_delete_calls().is_empty());
}

#[tokio::test]
async fn test_scale_down_deletes_in_foreground_and_marks_node() {
    let cluster = cluster_with(&[("pool-a", 3)]).await;
    let controller = initialized_controller(&cluster).await;

    controller.set_node_group_size("pool-a", 2).await.unwrap();

    let deletes = cluster.controller_delete_calls();
    assert_eq!(
        deletes,
        vec![ClusterCall::DeleteController {
            namespace: NAMESPACE.to_string(),
            name: "pool-a-seed-0".to_string(),
            propagation: Some(PropagationPolicy::Foreground),
        }]
    );
    assert!(controller.pending_deletions().is_marked("pool-a-seed-0-0"));
    assert_eq!(controller.get_node_group_size("pool-a").unwrap(), 2);

    // The node stays registered until it is deleted separately.
    assert!(cluster.node_delete_calls().is_empty());
    assert_eq!(common::node_count(&cluster), 3);
}

#[tokio::test]
async fn test_scale_down_prefers_unhealthy_members() {
    let cluster = cluster_with(&[("pool-a", 4)]).await;
    let controller = initialized_controller(&cluster).await;

    cluster
        .set_node_ready("pool-a-seed-2-0", ConditionStatus::False)
        .await
        .unwrap();
    cluster.nodes().remove("pool-a-seed-3-0").await;

    controller.set_node_group_size("pool-a", 2).await.unwrap();

    let deleted: Vec<_> = cluster
        .controller_delete_calls()
        .into_iter()
        .map(|call| match call {
            ClusterCall::DeleteController { name, .. } => name,
            other => panic!("unexpected call {other:?}"),
        })
        .collect();
    assert_eq!(deleted, vec!["pool-a-seed-3", "pool-a-seed-2"]);
}

#[tokio::test]
async fn test_delete_failure_leaves_member_unmarked() {
    let cluster = cluster_with(&[("pool-a", 2)]).await;
    let controller = initialized_controller(&cluster).await;
    cluster.fail_next_controller_deletes(3);

    let err = controller.set_node_group_size("pool-a", 1).await.unwrap_err();

    assert!(matches!(err, ControllerError::DeleteFailed { .. }));
    assert_eq!(cluster.controller_delete_calls().len(), 3);
    assert!(controller.pending_deletions().is_empty());
    assert_eq!(controller.get_node_group_size("pool-a").unwrap(), 2);
}

#[tokio::test]
async fn test_invalid_group_name_rejected() {
    let cluster = cluster_with(&[("pool-a", 1)]).await;
    let controller = initialized_controller(&cluster).await;

    let long = "x".repeat(64);
    for bad in ["", "-pool", "pool a", long.as_str()] {
        let err = controller.set_node_group_size(bad, 2).await.unwrap_err();
        assert!(matches!(err, ControllerError::InvalidGroupName(_)), "{bad:?}");
    }
    assert!(cluster.calls().is_empty());
}

#[tokio::test]
async fn test_resize_before_init_fails() {
    let cluster = cluster_with(&[("pool-a", 1)]).await;
    let controller = controller(&cluster);

    let err = controller.set_node_group_size("pool-a", 2).await.unwrap_err();
    assert!(matches!(err, ControllerError::NotInitialized));
    assert!(!controller.is_initialized());

    // Queries only need the caches.
    assert_eq!(controller.get_node_group_size("pool-a").unwrap(), 1);
}

#[tokio::test]
async fn test_init_without_members_is_fatal() {
    let cluster = cluster_with(&[]).await;
    let controller = controller(&cluster);
    let (_tx, rx) = watch::channel(false);

    let err = controller.init(rx).await.unwrap_err();
    assert!(matches!(err, ControllerError::MissingTemplate(_)));
    assert!(err.is_fatal());
}

#[tokio::test(start_paused = true)]
async fn test_init_cancelled_before_sync() {
    let cluster = std::sync::Arc::new(InMemoryCluster::new(NAMESPACE, GROUP_LABEL));
    let controller = controller(&cluster);
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let _ = tx.send(true);
    });

    let err = controller.init(rx).await.unwrap_err();
    assert!(matches!(err, ControllerError::CacheSyncCancelled));
}

#[tokio::test]
async fn test_committed_create_with_lost_response_counts_once() {
    let cluster = cluster_with(&[("pool-a", 1)]).await;
    let controller = controller_with_lost_responses(&cluster).await;

    controller.set_node_group_size("pool-a", 2).await.unwrap();

    assert_eq!(cluster.create_calls().len(), 2);
    assert_eq!(controller.get_node_group_size("pool-a").unwrap(), 2);
}

#[tokio::test]
async fn test_committed_delete_with_lost_response_marks_member() {
    let cluster = cluster_with(&[("pool-a", 2)]).await;
    let controller = controller_with_lost_responses(&cluster).await;

    controller.set_node_group_size("pool-a", 1).await.unwrap();

    assert_eq!(cluster.controller_delete_calls().len(), 2);
    assert_eq!(controller.get_node_group_size("pool-a").unwrap(), 1);
    assert!(controller.pending_deletions().is_marked("pool-a-seed-0-0"));
}

#[tokio::test]
async fn test_missing_controller_on_first_delete_is_not_retried() {
    let cluster = cluster_with(&[("pool-a", 2)]).await;
    let controller = initialized_controller(&cluster).await;

    // The pod outlives its controller.
    cluster
        .delete_controller(
            NAMESPACE,
            "pool-a-seed-0",
            &DeleteOptions {
                propagation: Some(PropagationPolicy::Orphan),
            },
        )
        .await
        .unwrap();

    let err = controller.set_node_group_size("pool-a", 0).await.unwrap_err();

    assert!(matches!(
        err,
        ControllerError::DeleteFailed {
            source: ClusterError::NotFound { .. },
            ..
        }
    ));
    assert!(!err.is_transient());
    assert_eq!(cluster.controller_delete_calls().len(), 2);
}

#[tokio::test]
async fn test_removing_member_without_node_leaves_nothing_pending() {
    let cluster = cluster_with(&[("pool-a", 2)]).await;
    let controller = initialized_controller(&cluster).await;
    cluster.nodes().remove("pool-a-seed-1-0").await;

    controller.set_node_group_size("pool-a", 1).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        cluster.controller_delete_calls(),
        vec![ClusterCall::DeleteController {
            namespace: NAMESPACE.to_string(),
            name: "pool-a-seed-1".to_string(),
            propagation: Some(PropagationPolicy::Foreground),
        }]
    );
    assert!(controller.pending_deletions().is_empty());
}
