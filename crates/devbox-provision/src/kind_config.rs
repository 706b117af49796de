//! Cluster configuration builder for `kind`.
//!
//! The document is emitted as JSON, which `kind create cluster --config -`
//! accepts as YAML.

use serde_json::{json, Value};

use crate::types::ClusterSpec;
use crate::{ProvisionError, Result};

/// `NodePort` the in-cluster `PostgreSQL` service listens on.
pub const POSTGRES_NODE_PORT: u16 = 30432;

/// Port the ingress controller binds on the control-plane node.
pub const INGRESS_CONTAINER_PORT: u16 = 80;

const INGRESS_READY_PATCH: &str = "kind: InitConfiguration
nodeRegistration:
  kubeletExtraArgs:
    node-labels: \"ingress-ready=true\"
";

/// Build the `kind` cluster document for a spec.
///
/// The control-plane node gets the ingress-ready label and one host port
/// mapping per allocated port; each worker is a bare worker node.
///
/// # Errors
///
/// Returns `ProvisionError::InvalidSpec` if the spec has no control plane
/// or an empty cluster name.
pub fn build_kind_config(spec: &ClusterSpec) -> Result<Value> {
    if spec.cluster_name.is_empty() {
        return Err(ProvisionError::InvalidSpec("cluster name is empty".into()));
    }
    if spec.node_spec.control_planes == 0 {
        return Err(ProvisionError::InvalidSpec(
            "at least one control-plane node is required".into(),
        ));
    }

    let mut mappings = Vec::new();
    if let Some(port) = spec.ingress_port {
        mappings.push(port_mapping(INGRESS_CONTAINER_PORT, port));
    }
    if let Some(port) = spec.postgres_port {
        mappings.push(port_mapping(POSTGRES_NODE_PORT, port));
    }

    let mut nodes = vec![json!({
        "role": "control-plane",
        "kubeadmConfigPatches": [INGRESS_READY_PATCH],
        "extraPortMappings": mappings,
    })];
    for _ in 1..spec.node_spec.control_planes {
        nodes.push(json!({ "role": "control-plane" }));
    }
    for _ in 0..spec.node_spec.workers {
        nodes.push(json!({ "role": "worker" }));
    }

    Ok(json!({
        "kind": "Cluster",
        "apiVersion": "kind.x-k8s.io/v1alpha4",
        "name": spec.cluster_name,
        "nodes": nodes,
    }))
}

fn port_mapping(container_port: u16, host_port: u16) -> Value {
    json!({
        "containerPort": container_port,
        "hostPort": host_port,
        "listenAddress": "127.0.0.1",
        "protocol": "TCP",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use devbox_store::Preset;

    fn spec(preset: Preset) -> ClusterSpec {
        ClusterSpec {
            cluster_name: "ops-dev-1019".into(),
            node_spec: preset.node_spec(),
            ingress_port: Some(30000),
            postgres_port: Some(30001),
        }
    }

    #[test]
    fn node_layout_follows_preset() {
        let config = build_kind_config(&spec(Preset::Performance)).unwrap();
        let nodes = config["nodes"].as_array().unwrap();
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0]["role"], "control-plane");
        assert_eq!(nodes[1]["role"], "worker");
        assert_eq!(nodes[2]["role"], "worker");
        assert_eq!(config["name"], "ops-dev-1019");
    }

    #[test]
    fn host_ports_are_mapped() {
        let config = build_kind_config(&spec(Preset::Development)).unwrap();
        let mappings = config["nodes"][0]["extraPortMappings"].as_array().unwrap();
        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings[0]["containerPort"], 80);
        assert_eq!(mappings[0]["hostPort"], 30000);
        assert_eq!(mappings[1]["containerPort"], i64::from(POSTGRES_NODE_PORT));
        assert_eq!(mappings[1]["hostPort"], 30001);
    }

    #[test]
    fn rejects_empty_name() {
        let mut bad = spec(Preset::Development);
        bad.cluster_name.clear();
        assert!(matches!(
            build_kind_config(&bad),
            Err(ProvisionError::InvalidSpec(_))
        ));
    }
}
