//! Node-group controller.
//!
//! Each group member is one backing controller in the hosting cluster whose
//! single pod registers as a node in the managed cluster. Growing a group
//! creates backing controllers from a template copied off an existing
//! member. Shrinking a group deletes backing controllers and marks their
//! nodes; the node objects are removed later by [`crate::NodeRemover`] once
//! they stop reporting Ready.

use std::cmp::Ordering;
use std::sync::{Arc, OnceLock};

use groupscale_naming::{GroupName, NameGenerator, RandomSuffix};
use groupscale_reconcile::{select_for_drain, DrainPriority, RetryPolicy};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::cluster::{
    wait_for_cache_sync, BackingController, ClusterError, ControllerClient, DeleteOptions, Labels, Lister,
    Node, NodeClient, Object, ObjectMeta, Pod, Selector, NAME_LABEL,
};
use crate::deletion::PendingDeletionSet;
use crate::error::ControllerError;

/// Result type for controller operations.
pub type ControllerResult<T> = Result<T, ControllerError>;

/// Namespace holding backing controllers.
pub const DEFAULT_NAMESPACE: &str = "kubemark";

/// Label that assigns a member to a node group.
pub const DEFAULT_GROUP_LABEL: &str = "autoscaling.k8s.io/nodegroup";

/// Caches and client for the cluster that runs the members.
#[derive(Clone)]
pub struct HostingCluster {
    pub controllers: Arc<dyn Lister<BackingController>>,
    pub pods: Arc<dyn Lister<Pod>>,
    pub client: Arc<dyn ControllerClient>,
}

/// Cache and client for the cluster the members register with.
#[derive(Clone)]
pub struct ManagedCluster {
    pub nodes: Arc<dyn Lister<Node>>,
    pub client: Arc<dyn NodeClient>,
}

/// Controller settings.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub namespace: String,
    pub group_label: String,
    /// Attempts per create or delete call.
    pub retry: RetryPolicy,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            group_label: DEFAULT_GROUP_LABEL.to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Scales node groups by creating and deleting backing controllers.
pub struct NodeGroupController {
    hosting: HostingCluster,
    managed: ManagedCluster,
    settings: ControllerSettings,
    names: Arc<dyn NameGenerator>,
    pending: Arc<PendingDeletionSet>,
    template: OnceLock<BackingController>,
}

impl NodeGroupController {
    /// Create a controller. It must be initialized with [`Self::init`] before
    /// it can change group sizes.
    pub fn new(hosting: HostingCluster, managed: ManagedCluster, settings: ControllerSettings) -> Self {
        Self {
            hosting,
            managed,
            settings,
            names: Arc::new(RandomSuffix),
            pending: Arc::new(PendingDeletionSet::new()),
            template: OnceLock::new(),
        }
    }

    /// Use `names` to name new members.
    pub fn with_name_generator(mut self, names: Arc<dyn NameGenerator>) -> Self {
        self.names = names;
        self
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub fn managed_cluster(&self) -> &ManagedCluster {
        &self.managed
    }

    /// Members whose backing controller was deleted but whose node has not
    /// been removed yet.
    pub fn pending_deletions(&self) -> Arc<PendingDeletionSet> {
        Arc::clone(&self.pending)
    }

    /// Returns true once the member template has been captured.
    pub fn is_initialized(&self) -> bool {
        self.template.get().is_some()
    }

    /// Wait for all caches to sync, then capture the member template.
    ///
    /// Fails with [`ControllerError::CacheSyncCancelled`] if shutdown is
    /// signaled first, and with [`ControllerError::MissingTemplate`] if no
    /// existing member can provide a template.
    pub async fn init(&self, mut shutdown: watch::Receiver<bool>) -> ControllerResult<()> {
        let synced = wait_for_cache_sync("nodegroup-controller", &mut shutdown, || {
            self.hosting.controllers.has_synced()
                && self.hosting.pods.has_synced()
                && self.managed.nodes.has_synced()
        })
        .await;
        if !synced {
            return Err(ControllerError::CacheSyncCancelled);
        }

        let template = self.build_template()?;
        if self.template.set(template).is_err() {
            debug!("Member template already captured");
        }

        info!(namespace = %self.settings.namespace, "Node-group controller initialized");
        Ok(())
    }

    /// Number of members in `group`, counted by backing controller.
    pub fn get_node_group_size(&self, group: &str) -> ControllerResult<usize> {
        let controllers = self.hosting.controllers.list(&self.group_selector(group))?;
        Ok(controllers.len())
    }

    /// Names of the members of `group`, which are also their node names.
    pub fn get_node_names_for_nodegroup(&self, group: &str) -> ControllerResult<Vec<String>> {
        let pods = self.hosting.pods.list(&self.group_selector(group))?;
        Ok(pods.into_iter().map(|pod| pod.meta.name).collect())
    }

    /// Grow or shrink `group` to exactly `size` members.
    #[instrument(skip(self))]
    pub async fn set_node_group_size(&self, group: &str, size: usize) -> ControllerResult<()> {
        let group = GroupName::parse(group)?;
        let template = self.template.get().ok_or(ControllerError::NotInitialized)?;

        let current = self.get_node_group_size(group.as_str())?;
        match size.cmp(&current) {
            Ordering::Greater => {
                let delta = size - current;
                info!(group = %group, current, target = size, "Scaling up node group");
                for _ in 0..delta {
                    self.add_member(&group, template).await?;
                }
            }
            Ordering::Less => {
                let delta = current - size;
                info!(group = %group, current, target = size, "Scaling down node group");
                self.remove_members(&group, delta).await?;
            }
            Ordering::Equal => {
                debug!(group = %group, size, "Node group already at target size");
            }
        }
        Ok(())
    }

    fn group_selector(&self, group: &str) -> Selector {
        Selector::from_labels([(self.settings.group_label.as_str(), group)])
    }

    /// Build a template from the backing controller of any registered node.
    fn build_template(&self) -> ControllerResult<BackingController> {
        let missing = ControllerError::MissingTemplate;

        let nodes = self
            .managed
            .nodes
            .list(&Selector::everything())
            .map_err(|e| missing(format!("listing nodes: {e}")))?;
        let node = nodes
            .first()
            .ok_or_else(|| missing("no nodes registered".to_string()))?;

        let pod = self
            .hosting
            .pods
            .get(node.name())
            .map_err(|e| missing(format!("reading pod {}: {e}", node.name())))?
            .ok_or_else(|| missing(format!("no pod backs node {}", node.name())))?;

        let owner = pod
            .meta
            .label(NAME_LABEL)
            .ok_or_else(|| missing(format!("pod {} has no {NAME_LABEL} label", pod.meta.name)))?;

        let seed = self
            .hosting
            .controllers
            .get(owner)
            .map_err(|e| missing(format!("reading controller {owner}: {e}")))?
            .ok_or_else(|| missing(format!("controller {owner} not found")))?;

        debug!(source = %seed.meta.name, "Captured member template");
        Ok(BackingController {
            meta: ObjectMeta::new(String::new(), self.settings.namespace.clone()),
            replicas: 1,
            selector: None,
            template: seed.template,
        })
    }

    async fn add_member(
        &self,
        group: &GroupName,
        template: &BackingController,
    ) -> ControllerResult<()> {
        let name = self.names.generate(group.as_str());
        let labels: Labels = [
            (self.settings.group_label.clone(), group.to_string()),
            (NAME_LABEL.to_string(), name.clone()),
        ]
        .into_iter()
        .collect();

        let mut controller = template.clone();
        controller.meta.name = name.clone();
        controller.meta.labels = labels.clone();
        controller.selector = Some(labels.clone());
        controller.template.labels = labels;

        let client = self.hosting.client.as_ref();
        let controller = &controller;
        self.settings
            .retry
            .run_if("create controller", ClusterError::is_transient, move |attempt| async move {
                debug!(attempt, member = %controller.meta.name, "Creating backing controller");
                match client.create_controller(controller).await {
                    Ok(_) => Ok(()),
                    // An earlier attempt was committed before it failed.
                    Err(ClusterError::AlreadyExists { .. }) if attempt > 1 => {
                        debug!(
                            attempt,
                            member = %controller.meta.name,
                            "Backing controller already created"
                        );
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            })
            .await
            .map_err(|source| ControllerError::CreateFailed {
                member: name.clone(),
                source,
            })?;

        info!(group = %group, member = %name, "Added member to node group");
        Ok(())
    }

    async fn remove_members(&self, group: &GroupName, count: usize) -> ControllerResult<()> {
        let members = self.get_node_names_for_nodegroup(group.as_str())?;
        if members.len() < count {
            return Err(ControllerError::InsufficientMembers {
                group: group.to_string(),
                requested: count,
                available: members.len(),
            });
        }

        let ordered = select_for_drain(members, |member| self.drain_priority(member));
        for member in ordered.into_iter().take(count) {
            self.remove_member(group, &member).await?;
        }
        Ok(())
    }

    /// Members without a node go first, then members whose node is not ready.
    fn drain_priority(&self, member: &str) -> DrainPriority {
        match self.managed.nodes.get(member) {
            Ok(None) => DrainPriority::Failed,
            Ok(Some(node)) if node.is_not_ready() => DrainPriority::NotReady,
            Ok(Some(_)) => DrainPriority::Healthy,
            Err(e) => {
                warn!(member, error = %e, "Cannot read node, treating member as healthy");
                DrainPriority::Healthy
            }
        }
    }

    async fn remove_member(&self, group: &GroupName, member: &str) -> ControllerResult<()> {
        let pod = self
            .hosting
            .pods
            .get(member)?
            .ok_or_else(|| ControllerError::MemberNotFound {
                member: member.to_string(),
            })?;

        if pod.meta.label(&self.settings.group_label) != Some(group.as_str()) {
            return Err(ControllerError::NotInGroup {
                member: member.to_string(),
                group: group.to_string(),
            });
        }

        let owner = pod
            .meta
            .label(NAME_LABEL)
            .ok_or_else(|| ControllerError::MissingOwner {
                member: member.to_string(),
            })?;

        let client = self.hosting.client.as_ref();
        let namespace = self.settings.namespace.as_str();
        let options = DeleteOptions::foreground();
        let options = &options;
        self.settings
            .retry
            .run_if("delete controller", ClusterError::is_transient, move |attempt| async move {
                debug!(attempt, controller = owner, "Deleting backing controller");
                match client.delete_controller(namespace, owner, options).await {
                    // An earlier attempt was committed before it failed.
                    Err(e) if e.is_not_found() && attempt > 1 => {
                        debug!(attempt, controller = owner, "Backing controller already deleted");
                        Ok(())
                    }
                    result => result,
                }
            })
            .await
            .map_err(|source| ControllerError::DeleteFailed {
                member: member.to_string(),
                source,
            })?;

        // A member without a registered node never produces a node update.
        if matches!(self.managed.nodes.get(member), Ok(None)) {
            info!(group = %group, member, controller = owner, "Removed member without a node");
            return Ok(());
        }

        self.pending.mark(member);
        info!(group = %group, member, controller = owner, "Removed member, node deletion pending");
        Ok(())
    }
}
