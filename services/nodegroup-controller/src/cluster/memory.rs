//! In-memory hosting and managed clusters.
//!
//! Backs the binary and the tests. Creating a backing controller starts one
//! pod and registers a Ready node of the same name. Deleting the controller
//! in the foreground removes its pods first, then the controller. Once the
//! heartbeat grace period passes, the node the pod hosted reports Unknown.
//! The node itself stays registered until it is deleted through
//! [`NodeClient`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::cache::{Informer, Lister};
use super::client::{ControllerClient, NodeClient};
use super::error::ClusterError;
use super::types::{
    BackingController, ConditionStatus, DeleteOptions, Labels, Node, Object, ObjectMeta, Pod,
    PodTemplate, PropagationPolicy, Selector, NAME_LABEL,
};
use crate::controller::{HostingCluster, ManagedCluster};

/// Time between a pod going away and its node reporting Unknown.
pub const DEFAULT_HEARTBEAT_GRACE: Duration = Duration::from_millis(20);

/// A mutating call made against the cluster, recorded whether or not it
/// succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterCall {
    CreateController {
        name: String,
        labels: Labels,
    },
    DeleteController {
        namespace: String,
        name: String,
        propagation: Option<PropagationPolicy>,
    },
    DeleteNode {
        name: String,
    },
}

#[derive(Debug, Default)]
struct Faults {
    creates: AtomicU32,
    controller_deletes: AtomicU32,
    node_deletes: AtomicU32,
}

/// Consume one pending fault, if any.
fn take_fault(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// In-memory hosting cluster (backing controllers and pods) plus managed
/// cluster (nodes).
pub struct InMemoryCluster {
    namespace: String,
    group_label: String,
    controllers: Arc<Informer<BackingController>>,
    pods: Arc<Informer<Pod>>,
    nodes: Arc<Informer<Node>>,
    heartbeat_grace: Duration,
    faults: Faults,
    calls: Mutex<Vec<ClusterCall>>,
}

impl InMemoryCluster {
    /// Create an empty cluster. Caches stay unsynced until [`Self::mark_synced`].
    pub fn new(namespace: impl Into<String>, group_label: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            group_label: group_label.into(),
            controllers: Arc::new(Informer::new("controllers")),
            pods: Arc::new(Informer::new("pods")),
            nodes: Arc::new(Informer::new("nodes")),
            heartbeat_grace: DEFAULT_HEARTBEAT_GRACE,
            faults: Faults::default(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Set how long a node keeps reporting Ready after its pod is gone.
    pub fn with_heartbeat_grace(mut self, grace: Duration) -> Self {
        self.heartbeat_grace = grace;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn controllers(&self) -> Arc<Informer<BackingController>> {
        Arc::clone(&self.controllers)
    }

    pub fn pods(&self) -> Arc<Informer<Pod>> {
        Arc::clone(&self.pods)
    }

    pub fn nodes(&self) -> Arc<Informer<Node>> {
        Arc::clone(&self.nodes)
    }

    /// Hosting-cluster handles for a [`crate::NodeGroupController`].
    pub fn hosting(self: &Arc<Self>) -> HostingCluster {
        HostingCluster {
            controllers: self.controllers(),
            pods: self.pods(),
            client: Arc::clone(self) as Arc<dyn ControllerClient>,
        }
    }

    /// Managed-cluster handles for a [`crate::NodeGroupController`].
    pub fn managed(self: &Arc<Self>) -> ManagedCluster {
        ManagedCluster {
            nodes: self.nodes(),
            client: Arc::clone(self) as Arc<dyn NodeClient>,
        }
    }

    /// Mark every cache as having completed its initial listing.
    pub fn mark_synced(&self) {
        self.controllers.mark_synced();
        self.pods.mark_synced();
        self.nodes.mark_synced();
    }

    /// Add a running member to `group` without going through the client.
    ///
    /// The backing controller carries a default template, so a seeded member
    /// can serve as the template for new ones.
    pub async fn seed_member(&self, group: &str, controller: &str) -> Result<String, ClusterError> {
        let labels: Labels = [
            (self.group_label.clone(), group.to_string()),
            (NAME_LABEL.to_string(), controller.to_string()),
        ]
        .into_iter()
        .collect();

        let controller = BackingController {
            meta: ObjectMeta {
                name: controller.to_string(),
                namespace: self.namespace.clone(),
                labels: labels.clone(),
            },
            replicas: 1,
            selector: Some(labels.clone()),
            template: PodTemplate {
                labels,
                spec: serde_json::json!({
                    "containers": [{"name": "hollow-node", "image": "hollow-node:latest"}]
                }),
            },
        };
        self.start(controller).await
    }

    /// Set the Ready condition of a node.
    pub async fn set_node_ready(&self, name: &str, status: ConditionStatus) -> Result<(), ClusterError> {
        let mut node = self
            .nodes
            .get(name)?
            .ok_or_else(|| not_found::<Node>(name))?;
        node.ready = Some(status);
        self.nodes.upsert(node).await;
        Ok(())
    }

    /// Fail the next `n` controller creates with a transient error.
    pub fn fail_next_creates(&self, n: u32) {
        self.faults.creates.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` controller deletes with a transient error.
    pub fn fail_next_controller_deletes(&self, n: u32) {
        self.faults.controller_deletes.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` node deletes with a transient error.
    pub fn fail_next_node_deletes(&self, n: u32) {
        self.faults.node_deletes.store(n, Ordering::SeqCst);
    }

    /// Every mutating call so far, in order.
    pub fn calls(&self) -> Vec<ClusterCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn create_calls(&self) -> Vec<ClusterCall> {
        self.calls_matching(|c| matches!(c, ClusterCall::CreateController { .. }))
    }

    pub fn controller_delete_calls(&self) -> Vec<ClusterCall> {
        self.calls_matching(|c| matches!(c, ClusterCall::DeleteController { .. }))
    }

    pub fn node_delete_calls(&self) -> Vec<ClusterCall> {
        self.calls_matching(|c| matches!(c, ClusterCall::DeleteNode { .. }))
    }

    /// Number of members of `group` according to the pod cache.
    pub fn member_count(&self, group: &str) -> usize {
        self.pods
            .list(&Selector::from_labels([(self.group_label.as_str(), group)]))
            .map(|pods| pods.len())
            .unwrap_or(0)
    }

    fn calls_matching(&self, f: impl Fn(&ClusterCall) -> bool) -> Vec<ClusterCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|c| f(c))
            .cloned()
            .collect()
    }

    fn record(&self, call: ClusterCall) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }

    /// Mark `nodes` Unknown once the heartbeat grace period has passed.
    fn expire_heartbeats(&self, nodes: Vec<String>) {
        let cache = Arc::clone(&self.nodes);
        let grace = self.heartbeat_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            for name in nodes {
                if let Ok(Some(mut node)) = cache.get(&name) {
                    node.ready = Some(ConditionStatus::Unknown);
                    cache.upsert(node).await;
                    debug!(node = %name, "Node heartbeat expired");
                }
            }
        });
    }

    /// Store a controller, start its pod and register the pod's node.
    async fn start(&self, controller: BackingController) -> Result<String, ClusterError> {
        let name = controller.meta.name.clone();
        if self.controllers.get(&name)?.is_some() {
            return Err(ClusterError::AlreadyExists {
                kind: BackingController::KIND,
                name,
            });
        }

        let pod_name = format!("{name}-0");
        let pod = Pod {
            meta: ObjectMeta {
                name: pod_name.clone(),
                namespace: controller.meta.namespace.clone(),
                labels: controller.template.labels.clone(),
            },
        };

        self.controllers.upsert(controller).await;
        self.pods.upsert(pod).await;
        self.nodes
            .upsert(Node::new(pod_name.clone(), ConditionStatus::True))
            .await;

        debug!(controller = %name, member = %pod_name, "Started member");
        Ok(pod_name)
    }
}

fn not_found<T: Object>(name: &str) -> ClusterError {
    ClusterError::NotFound {
        kind: T::KIND,
        name: name.to_string(),
    }
}

fn injected(operation: &str) -> ClusterError {
    ClusterError::Unavailable(format!("injected failure in {operation}"))
}

#[async_trait]
impl ControllerClient for InMemoryCluster {
    async fn create_controller(
        &self,
        controller: &BackingController,
    ) -> Result<BackingController, ClusterError> {
        self.record(ClusterCall::CreateController {
            name: controller.meta.name.clone(),
            labels: controller.meta.labels.clone(),
        });

        if take_fault(&self.faults.creates) {
            return Err(injected("create controller"));
        }

        self.start(controller.clone()).await?;
        Ok(controller.clone())
    }

    async fn delete_controller(
        &self,
        namespace: &str,
        name: &str,
        options: &DeleteOptions,
    ) -> Result<(), ClusterError> {
        self.record(ClusterCall::DeleteController {
            namespace: namespace.to_string(),
            name: name.to_string(),
            propagation: options.propagation,
        });

        if take_fault(&self.faults.controller_deletes) {
            return Err(injected("delete controller"));
        }

        if namespace != self.namespace || self.controllers.get(name)?.is_none() {
            return Err(not_found::<BackingController>(name));
        }

        let pods = self
            .pods
            .list(&Selector::from_labels([(NAME_LABEL, name)]))?;

        if options.propagation != Some(PropagationPolicy::Orphan) {
            for pod in &pods {
                self.pods.remove(pod.name()).await;
            }
        }
        self.controllers.remove(name).await;

        if options.propagation != Some(PropagationPolicy::Orphan) {
            let hosted: Vec<String> = pods.iter().map(|pod| pod.name().to_string()).collect();
            self.expire_heartbeats(hosted);
        }

        info!(controller = %name, pods = pods.len(), "Deleted backing controller");
        Ok(())
    }

    async fn get_controller(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BackingController, ClusterError> {
        match self.controllers.get(name)? {
            Some(controller) if controller.meta.namespace == namespace => Ok(controller),
            _ => Err(not_found::<BackingController>(name)),
        }
    }
}

#[async_trait]
impl NodeClient for InMemoryCluster {
    async fn delete_node(&self, name: &str, _options: &DeleteOptions) -> Result<(), ClusterError> {
        self.record(ClusterCall::DeleteNode {
            name: name.to_string(),
        });

        if take_fault(&self.faults.node_deletes) {
            return Err(injected("delete node"));
        }

        match self.nodes.remove(name).await {
            Some(_) => {
                info!(node = %name, "Deleted node");
                Ok(())
            }
            None => Err(not_found::<Node>(name)),
        }
    }

    async fn get_node(&self, name: &str) -> Result<Node, ClusterError> {
        self.nodes.get(name)?.ok_or_else(|| not_found::<Node>(name))
    }
}
