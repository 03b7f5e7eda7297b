//! Objects the controller reads and writes.
//!
//! Only the fields the controller depends on are modelled. The container
//! spec inside a pod template is carried as opaque JSON.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Object labels.
pub type Labels = BTreeMap<String, String>;

/// Label carrying the name of the backing controller that owns a pod.
pub const NAME_LABEL: &str = "name";

/// Metadata common to every object.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,

    #[serde(default)]
    pub namespace: String,

    #[serde(default)]
    pub labels: Labels,
}

impl ObjectMeta {
    /// Create metadata with no labels.
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            labels: Labels::new(),
        }
    }

    /// Add a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Look up a label value.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Anything that can be stored in a cache.
pub trait Object: Clone + fmt::Debug + Send + Sync + 'static {
    /// Kind name, used in errors and logs.
    const KIND: &'static str;

    fn meta(&self) -> &ObjectMeta;

    fn name(&self) -> &str {
        &self.meta().name
    }
}

/// Template for the pods a backing controller runs.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PodTemplate {
    #[serde(default)]
    pub labels: Labels,

    /// Container spec, passed through untouched.
    #[serde(default)]
    pub spec: serde_json::Value,
}

/// Replicated resource in the hosting cluster that runs one group member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackingController {
    pub meta: ObjectMeta,
    pub replicas: u32,

    #[serde(default)]
    pub selector: Option<Labels>,

    pub template: PodTemplate,
}

impl Object for BackingController {
    const KIND: &'static str = "controller";

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }
}

/// A member instance running in the hosting cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub meta: ObjectMeta,
}

impl Object for Pod {
    const KIND: &'static str = "pod";

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }
}

/// Status of a node condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// A member as registered in the managed cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub meta: ObjectMeta,

    /// Status of the Ready condition, if the node reports one.
    #[serde(default)]
    pub ready: Option<ConditionStatus>,
}

impl Node {
    /// Create a node with the given Ready status.
    pub fn new(name: impl Into<String>, ready: ConditionStatus) -> Self {
        Self {
            meta: ObjectMeta::new(name, ""),
            ready: Some(ready),
        }
    }

    /// A node is not ready when it reports a Ready condition that is not `True`.
    pub fn is_not_ready(&self) -> bool {
        matches!(self.ready, Some(status) if status != ConditionStatus::True)
    }
}

impl Object for Node {
    const KIND: &'static str = "node";

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }
}

/// Exact-match label selector.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Selector {
    requirements: Labels,
}

impl Selector {
    /// Matches every object.
    pub fn everything() -> Self {
        Self::default()
    }

    /// Matches objects carrying all of the given labels.
    pub fn from_labels<K, V>(labels: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            requirements: labels
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.requirements
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }

    pub fn is_everything(&self) -> bool {
        self.requirements.is_empty()
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.requirements {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{k}={v}")?;
            first = false;
        }
        Ok(())
    }
}

/// How dependents are handled when an object is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropagationPolicy {
    /// Leave dependents in place.
    Orphan,
    /// Delete the object now, dependents afterwards.
    Background,
    /// Delete dependents before the object's deletion completes.
    Foreground,
}

/// Options for a delete call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeleteOptions {
    pub propagation: Option<PropagationPolicy>,
}

impl DeleteOptions {
    /// Foreground cascading delete.
    pub fn foreground() -> Self {
        Self {
            propagation: Some(PropagationPolicy::Foreground),
        }
    }
}
