//! Controller errors.

use groupscale_naming::NameError;
use thiserror::Error;

use crate::cluster::ClusterError;

/// Errors returned by [`crate::NodeGroupController`].
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("invalid node group name: {0}")]
    InvalidGroupName(#[from] NameError),

    #[error("cache error: {0}")]
    Cache(#[from] ClusterError),

    #[error("controller not initialized")]
    NotInitialized,

    #[error("cache sync cancelled")]
    CacheSyncCancelled,

    #[error("cannot build member template: {0}")]
    MissingTemplate(String),

    #[error(
        "cannot remove {requested} members from node group {group}: only {available} present"
    )]
    InsufficientMembers {
        group: String,
        requested: usize,
        available: usize,
    },

    #[error("member {member} does not exist")]
    MemberNotFound { member: String },

    #[error("member {member} does not belong to node group {group}")]
    NotInGroup { member: String, group: String },

    #[error("member {member} has no owning controller")]
    MissingOwner { member: String },

    #[error("failed to create member {member}: {source}")]
    CreateFailed {
        member: String,
        #[source]
        source: ClusterError,
    },

    #[error("failed to delete member {member}: {source}")]
    DeleteFailed {
        member: String,
        #[source]
        source: ClusterError,
    },
}

impl ControllerError {
    /// Returns true if the same request may succeed later.
    ///
    /// Cache reads and cluster calls that failed transiently are worth
    /// repeating. Everything else reflects bad input or a broken invariant.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Cache(_) => true,
            Self::CreateFailed { source, .. } | Self::DeleteFailed { source, .. } => {
                source.is_transient()
            }
            _ => false,
        }
    }

    /// Returns true if the controller cannot operate at all.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::MissingTemplate(_) | Self::CacheSyncCancelled)
    }
}
