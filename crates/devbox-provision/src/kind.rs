//! Container cluster provisioner backed by `kind`.
//!
//! Cluster bring-up and tear-down shell out to the `kind` CLI. Stop/start
//! scaling goes through the Kubernetes API of the target cluster: every
//! Deployment and StatefulSet outside the system namespaces is scaled to zero
//! and its replica count remembered in an annotation, then restored from it.

use std::fmt::Debug;
use std::process::Stdio;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::config::KubeConfigOptions;
use kube::{Client, Config, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use devbox_core::ClusterHandle;

use crate::kind_config::build_kind_config;
use crate::types::{ClusterSpec, ProvisionerConfig, Sizing};
use crate::{ProvisionError, Result};

/// Annotation holding a workload's replica count while the cluster is stopped.
pub const ORIGINAL_REPLICAS_ANNOTATION: &str = "devbox.dev/original-replicas";

/// The `ClusterProvisioner` trait defines the interface for cluster bring-up.
#[async_trait]
pub trait ClusterProvisioner: Send + Sync {
    /// Create a cluster.
    ///
    /// # Errors
    ///
    /// Returns an error if the cluster cannot be created. Partially created
    /// resources may remain; pass a handle for the spec to `tear_down`.
    async fn provision(&self, spec: &ClusterSpec) -> Result<ClusterHandle>;

    /// Scale a cluster's workloads.
    ///
    /// # Errors
    ///
    /// Returns an error if the cluster is unreachable or a patch fails.
    async fn scale(&self, handle: &ClusterHandle, sizing: &Sizing) -> Result<()>;

    /// Delete a cluster. Deleting a missing cluster succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if deletion fails.
    async fn tear_down(&self, handle: &ClusterHandle) -> Result<()>;

    /// Check whether the cluster still exists.
    ///
    /// # Errors
    ///
    /// Returns an error if existence cannot be determined.
    async fn exists(&self, handle: &ClusterHandle) -> Result<bool>;
}

/// Provisioner driving the `kind` CLI.
pub struct KindProvisioner {
    config: ProvisionerConfig,
}

impl KindProvisioner {
    /// Create a provisioner.
    #[must_use]
    pub const fn new(config: ProvisionerConfig) -> Self {
        Self { config }
    }

    /// Get a reference to the provisioner config.
    #[must_use]
    pub const fn config(&self) -> &ProvisionerConfig {
        &self.config
    }

    fn kind(&self) -> Command {
        Command::new(&self.config.kind_binary)
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let command = format!("{} {}", self.config.kind_binary, args.join(" "));
        debug!(%command, "Running");
        let output = self
            .kind()
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| ProvisionError::Spawn {
                command: command.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(ProvisionError::CommandFailed {
                command,
                output: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn client_for(handle: &ClusterHandle) -> Result<Client> {
        let config = Config::from_kubeconfig(&KubeConfigOptions {
            context: Some(handle.context.clone()),
            ..Default::default()
        })
        .await
        .map_err(|e| ProvisionError::Kubeconfig {
            context: handle.context.clone(),
            message: e.to_string(),
        })?;
        Ok(Client::try_from(config)?)
    }

    async fn suspend<K>(&self, client: &Client) -> Result<u32>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Replicated
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let all: Api<K> = Api::all(client.clone());
        let mut scaled = 0;
        for workload in all.list(&ListParams::default()).await? {
            let Some(namespace) = workload.namespace() else {
                continue;
            };
            if self.config.is_system_namespace(&namespace) {
                continue;
            }
            let replicas = workload.replicas();
            if replicas == 0 {
                continue;
            }
            let patch = json!({
                "metadata": { "annotations": { (ORIGINAL_REPLICAS_ANNOTATION): replicas.to_string() } },
                "spec": { "replicas": 0 },
            });
            Api::<K>::namespaced(client.clone(), &namespace)
                .patch(&workload.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            scaled += 1;
        }
        Ok(scaled)
    }

    async fn resume<K>(&self, client: &Client) -> Result<u32>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Replicated
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let all: Api<K> = Api::all(client.clone());
        let mut restored = 0;
        for workload in all.list(&ListParams::default()).await? {
            let Some(namespace) = workload.namespace() else {
                continue;
            };
            let Some(original) = workload.annotations().get(ORIGINAL_REPLICAS_ANNOTATION) else {
                continue;
            };
            let Ok(replicas) = original.parse::<i32>() else {
                warn!(
                    workload = %workload.name_any(),
                    %namespace,
                    value = %original,
                    "Ignoring unparseable replica annotation"
                );
                continue;
            };
            let patch = json!({
                "metadata": { "annotations": { (ORIGINAL_REPLICAS_ANNOTATION): null } },
                "spec": { "replicas": replicas },
            });
            Api::<K>::namespaced(client.clone(), &namespace)
                .patch(&workload.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            restored += 1;
        }
        Ok(restored)
    }
}

#[async_trait]
impl ClusterProvisioner for KindProvisioner {
    async fn provision(&self, spec: &ClusterSpec) -> Result<ClusterHandle> {
        let document = build_kind_config(spec)?;
        let wait = format!("{}s", self.config.wait_seconds);
        let command = format!(
            "{} create cluster --name {} --config - --wait {wait}",
            self.config.kind_binary, spec.cluster_name
        );

        info!(cluster = %spec.cluster_name, workers = spec.node_spec.workers, "Creating cluster");

        let mut child = self
            .kind()
            .args([
                "create",
                "cluster",
                "--name",
                &spec.cluster_name,
                "--config",
                "-",
                "--wait",
                &wait,
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ProvisionError::Spawn {
                command: command.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(document.to_string().as_bytes())
                .await
                .map_err(|source| ProvisionError::Spawn {
                    command: command.clone(),
                    source,
                })?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|source| ProvisionError::Spawn {
                command: command.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(ProvisionError::CommandFailed {
                command,
                output: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        info!(cluster = %spec.cluster_name, "Cluster created");
        Ok(ClusterHandle::new(&spec.cluster_name, spec.context()))
    }

    async fn scale(&self, handle: &ClusterHandle, sizing: &Sizing) -> Result<()> {
        if !self.exists(handle).await? {
            return Err(ProvisionError::ClusterNotFound(handle.cluster_name.clone()));
        }
        let client = Self::client_for(handle).await?;
        match sizing {
            Sizing::Suspended => {
                let scaled = self.suspend::<Deployment>(&client).await?
                    + self.suspend::<StatefulSet>(&client).await?;
                info!(cluster = %handle, workloads = scaled, "Scaled workloads to zero");
            }
            Sizing::Active(node_spec) => {
                let restored = self.resume::<Deployment>(&client).await?
                    + self.resume::<StatefulSet>(&client).await?;
                info!(
                    cluster = %handle,
                    workloads = restored,
                    workers = node_spec.workers,
                    "Restored workloads"
                );
            }
        }
        Ok(())
    }

    async fn tear_down(&self, handle: &ClusterHandle) -> Result<()> {
        self.run(&["delete", "cluster", "--name", &handle.cluster_name])
            .await?;
        info!(cluster = %handle, "Cluster deleted");
        Ok(())
    }

    async fn exists(&self, handle: &ClusterHandle) -> Result<bool> {
        let clusters = self.run(&["get", "clusters"]).await?;
        Ok(parse_cluster_list(&clusters)
            .iter()
            .any(|name| *name == handle.cluster_name))
    }
}

/// Parse `kind get clusters` output into cluster names.
fn parse_cluster_list(output: &str) -> Vec<&str> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("No kind clusters"))
        .collect()
}

/// Workloads with a replica count.
pub trait Replicated {
    /// Desired replicas, defaulting to 1 when unset.
    fn replicas(&self) -> i32;
}

impl Replicated for Deployment {
    fn replicas(&self) -> i32 {
        self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)
    }
}

impl Replicated for StatefulSet {
    fn replicas(&self) -> i32 {
        self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)
    }
}

/// Mock provisioner for testing.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};
    use std::time::Duration;

    /// A mock provisioner that tracks clusters in memory.
    #[derive(Default)]
    pub struct MockProvisioner {
        clusters: Mutex<HashMap<String, MockCluster>>,
        failing: Mutex<HashSet<&'static str>>,
        failure_text: Mutex<String>,
        delays: Mutex<HashMap<&'static str, Duration>>,
        torn_down: Mutex<Vec<String>>,
    }

    struct MockCluster {
        spec: ClusterSpec,
        history: Vec<Sizing>,
    }

    impl MockProvisioner {
        /// Create a new mock provisioner.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Make every call to `operation` (`provision`, `scale`, `tear_down`,
        /// `exists`) fail with `output` as the tool's error text.
        pub fn fail(&self, operation: &'static str, output: &str) {
            self.failing.lock().insert(operation);
            *self.failure_text.lock() = output.to_string();
        }

        /// Make every call to `operation` take at least `delay`.
        pub fn delay(&self, operation: &'static str, delay: Duration) {
            self.delays.lock().insert(operation, delay);
        }

        /// Stop injecting failures.
        pub fn heal(&self) {
            self.failing.lock().clear();
        }

        /// Remove a cluster behind the controller's back.
        pub fn remove_externally(&self, cluster_name: &str) {
            self.clusters.lock().remove(cluster_name);
        }

        /// Get the number of live clusters.
        #[must_use]
        pub fn cluster_count(&self) -> usize {
            self.clusters.lock().len()
        }

        /// Get the spec a cluster was provisioned with.
        #[must_use]
        pub fn get_spec(&self, cluster_name: &str) -> Option<ClusterSpec> {
            self.clusters.lock().get(cluster_name).map(|c| c.spec.clone())
        }

        /// Get every sizing applied to a cluster, oldest first.
        #[must_use]
        pub fn sizing_history(&self, cluster_name: &str) -> Vec<Sizing> {
            self.clusters
                .lock()
                .get(cluster_name)
                .map(|c| c.history.clone())
                .unwrap_or_default()
        }

        /// Names passed to `tear_down`, in call order.
        #[must_use]
        pub fn torn_down(&self) -> Vec<String> {
            self.torn_down.lock().clone()
        }

        async fn pause(&self, operation: &'static str) {
            let delay = self.delays.lock().get(operation).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
        }

        fn check(&self, operation: &'static str) -> Result<()> {
            if self.failing.lock().contains(operation) {
                return Err(ProvisionError::CommandFailed {
                    command: format!("mock {operation}"),
                    output: self.failure_text.lock().clone(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ClusterProvisioner for MockProvisioner {
        async fn provision(&self, spec: &ClusterSpec) -> Result<ClusterHandle> {
            build_kind_config(spec)?;
            self.pause("provision").await;
            self.check("provision")?;
            self.clusters.lock().insert(
                spec.cluster_name.clone(),
                MockCluster {
                    spec: spec.clone(),
                    history: vec![Sizing::Active(spec.node_spec.clone())],
                },
            );
            Ok(ClusterHandle::new(&spec.cluster_name, spec.context()))
        }

        async fn scale(&self, handle: &ClusterHandle, sizing: &Sizing) -> Result<()> {
            self.pause("scale").await;
            self.check("scale")?;
            let mut clusters = self.clusters.lock();
            let cluster = clusters
                .get_mut(&handle.cluster_name)
                .ok_or_else(|| ProvisionError::ClusterNotFound(handle.cluster_name.clone()))?;
            cluster.history.push(sizing.clone());
            Ok(())
        }

        async fn tear_down(&self, handle: &ClusterHandle) -> Result<()> {
            self.pause("tear_down").await;
            self.check("tear_down")?;
            self.clusters.lock().remove(&handle.cluster_name);
            self.torn_down.lock().push(handle.cluster_name.clone());
            Ok(())
        }

        async fn exists(&self, handle: &ClusterHandle) -> Result<bool> {
            self.check("exists")?;
            Ok(self.clusters.lock().contains_key(&handle.cluster_name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockProvisioner;
    use super::*;
    use devbox_store::Preset;

    fn test_spec() -> ClusterSpec {
        ClusterSpec {
            cluster_name: "ops-dev-1019".into(),
            node_spec: Preset::Development.node_spec(),
            ingress_port: Some(30000),
            postgres_port: Some(30001),
        }
    }

    #[test]
    fn parses_cluster_list() {
        assert_eq!(parse_cluster_list("a\nb\n\n"), vec!["a", "b"]);
        assert!(parse_cluster_list("No kind clusters found.\n").is_empty());
    }

    #[test]
    fn replicas_default_to_one() {
        assert_eq!(Deployment::default().replicas(), 1);
    }

    #[tokio::test]
    async fn mock_provision_and_tear_down() {
        let provisioner = MockProvisioner::new();
        let handle = provisioner.provision(&test_spec()).await.unwrap();
        assert_eq!(handle.context, "kind-ops-dev-1019");
        assert!(provisioner.exists(&handle).await.unwrap());

        provisioner.tear_down(&handle).await.unwrap();
        assert!(!provisioner.exists(&handle).await.unwrap());
        assert_eq!(provisioner.torn_down(), vec!["ops-dev-1019".to_string()]);
    }

    #[tokio::test]
    async fn mock_records_sizing() {
        let provisioner = MockProvisioner::new();
        let spec = test_spec();
        let handle = provisioner.provision(&spec).await.unwrap();

        provisioner.scale(&handle, &Sizing::Suspended).await.unwrap();
        provisioner
            .scale(&handle, &Sizing::Active(spec.node_spec.clone()))
            .await
            .unwrap();

        let history = provisioner.sizing_history("ops-dev-1019");
        assert_eq!(history.len(), 3);
        assert_eq!(history[1], Sizing::Suspended);
        assert_eq!(history[2], Sizing::Active(spec.node_spec));
    }

    #[tokio::test]
    async fn mock_failure_preserves_text() {
        let provisioner = MockProvisioner::new();
        provisioner.fail("provision", "ERROR: failed to create cluster: docker not running");

        let err = provisioner.provision(&test_spec()).await.unwrap_err();
        assert_eq!(
            err.tool_output(),
            Some("ERROR: failed to create cluster: docker not running")
        );
        assert_eq!(provisioner.cluster_count(), 0);
    }
}
