//! Node-group controller library.
//!
//! Scales groups of nodes in a managed cluster. Every member of a group is a
//! backing controller in a hosting cluster running one pod, and that pod
//! registers with the managed cluster as a node of the same name.
//!
//! ## Architecture
//!
//! ```text
//! Service
//! ├── NodeGroupScaler   (target sizes -> queue "node-group-scale")
//! │   └── NodeGroupController::set_node_group_size
//! ├── resync loop       (requeues every group periodically)
//! ├── DeletionWatcher   (node events -> queue "node-deletion")
//! └── NodeRemover       (deletes nodes of removed members)
//! ```
//!
//! Scaling up creates backing controllers from a template copied off an
//! existing member. Scaling down deletes backing controllers in the
//! foreground and marks their nodes. A marked node is deleted once it stops
//! reporting Ready.
//!
//! ## Modules
//!
//! - `cluster`: object model, caches, clients and the in-memory cluster
//! - `controller`: group size queries and changes
//! - `deletion`: deferred node deletion
//! - `scaler`: queue-driven convergence to target sizes
//! - `service`: task wiring used by the binary

pub mod cluster;
pub mod config;
pub mod controller;
pub mod deletion;
pub mod error;
pub mod scaler;
pub mod service;

pub use config::Config;
pub use controller::{
    ControllerResult, ControllerSettings, HostingCluster, ManagedCluster, NodeGroupController,
};
pub use deletion::{DeletionWatcher, NodeRemover, PendingDeletionSet};
pub use error::ControllerError;
pub use scaler::NodeGroupScaler;
pub use service::Service;
