//! Types for the provision crate.

use devbox_store::NodeSpec;
use serde::{Deserialize, Serialize};

/// What to provision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    /// Cluster name; also the suffix of the kubeconfig context.
    pub cluster_name: String,
    /// Node counts and resources.
    pub node_spec: NodeSpec,
    /// Host port mapped to the ingress controller.
    pub ingress_port: Option<u16>,
    /// Host port mapped to the in-cluster `PostgreSQL` `NodePort`.
    pub postgres_port: Option<u16>,
}

impl ClusterSpec {
    /// Kubeconfig context the provisioner creates for this cluster.
    #[must_use]
    pub fn context(&self) -> String {
        format!("kind-{}", self.cluster_name)
    }
}

/// Target sizing for a scale operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "node_spec", rename_all = "snake_case")]
pub enum Sizing {
    /// Workloads scaled to zero; cluster identity and config preserved.
    Suspended,
    /// Workloads restored to their original replica counts.
    Active(NodeSpec),
}

/// Configuration for the kind provisioner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionerConfig {
    /// Path or name of the `kind` binary.
    pub kind_binary: String,
    /// How long `kind create cluster` waits for the control plane.
    pub wait_seconds: u64,
    /// Namespaces whose workloads are never scaled.
    pub system_namespaces: Vec<String>,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            kind_binary: "kind".to_string(),
            wait_seconds: 120,
            system_namespaces: vec![
                "kube-system".to_string(),
                "kube-public".to_string(),
                "kube-node-lease".to_string(),
                "local-path-storage".to_string(),
                "ingress-nginx".to_string(),
            ],
        }
    }
}

impl ProvisionerConfig {
    /// Load overrides from environment variables.
    ///
    /// Supported environment variables:
    /// - `DEVBOX_KIND_BINARY`: path of the `kind` binary
    /// - `DEVBOX_KIND_WAIT_SECONDS`: control-plane wait passed to `kind create cluster`
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(val) = std::env::var("DEVBOX_KIND_BINARY") {
            config.kind_binary = val;
        }
        if let Ok(val) = std::env::var("DEVBOX_KIND_WAIT_SECONDS") {
            if let Ok(n) = val.parse() {
                config.wait_seconds = n;
            }
        }
        config
    }

    /// Returns true if workloads in `namespace` must be left alone.
    #[must_use]
    pub fn is_system_namespace(&self, namespace: &str) -> bool {
        self.system_namespaces.iter().any(|ns| ns == namespace)
    }
}
