//! Write access to the hosting and managed clusters.

use async_trait::async_trait;

use super::error::ClusterError;
use super::types::{BackingController, DeleteOptions, Node};

/// Backing-controller API of the hosting cluster.
#[async_trait]
pub trait ControllerClient: Send + Sync {
    /// Create a backing controller. Fails with `AlreadyExists` on a name clash.
    async fn create_controller(
        &self,
        controller: &BackingController,
    ) -> Result<BackingController, ClusterError>;

    /// Delete a backing controller.
    async fn delete_controller(
        &self,
        namespace: &str,
        name: &str,
        options: &DeleteOptions,
    ) -> Result<(), ClusterError>;

    /// Read a backing controller directly, bypassing caches.
    async fn get_controller(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BackingController, ClusterError>;
}

/// Node API of the managed cluster.
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn delete_node(&self, name: &str, options: &DeleteOptions) -> Result<(), ClusterError>;

    async fn get_node(&self, name: &str) -> Result<Node, ClusterError>;
}
