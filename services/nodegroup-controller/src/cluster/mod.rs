//! Cluster object model, caches and clients.

pub mod cache;
pub mod client;
pub mod error;
pub mod memory;
pub mod types;

pub use cache::{wait_for_cache_sync, Informer, Lister, WatchEvent};
pub use client::{ControllerClient, NodeClient};
pub use error::ClusterError;
pub use memory::{ClusterCall, InMemoryCluster};
pub use types::{
    BackingController, ConditionStatus, DeleteOptions, Labels, Node, Object, ObjectMeta, Pod,
    PodTemplate, PropagationPolicy, Selector, NAME_LABEL,
};
