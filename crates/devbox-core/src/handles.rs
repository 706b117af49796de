//! Opaque handles to external resources.
//!
//! Handles are persisted in records so that a later invocation can find and
//! supervise resources an earlier invocation created. They carry identity
//! only; liveness and termination belong to the collaborator that issued them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Handle to a cluster created by the container cluster provisioner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterHandle {
    /// Name the provisioner knows the cluster by.
    pub cluster_name: String,
    /// Kubeconfig context that targets the cluster.
    pub context: String,
}

impl ClusterHandle {
    /// Create a handle for a cluster name and its kubeconfig context.
    #[must_use]
    pub fn new(cluster_name: impl Into<String>, context: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            context: context.into(),
        }
    }
}

impl fmt::Display for ClusterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cluster_name)
    }
}

/// Handle to a detached background process.
///
/// Only the identifier is stored; it makes no assumption about the process
/// model beyond "an id that the launcher can check and terminate".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessHandle(u32);

impl ProcessHandle {
    /// Wrap a raw process identifier.
    #[must_use]
    pub const fn from_raw(id: u32) -> Self {
        Self(id)
    }

    /// Return the raw process identifier.
    #[must_use]
    pub const fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
