//! Domain types stored under the state root.
//!
//! These types represent the persisted state of deployments, connection
//! profiles, the allocation ledger, and usage events.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use devbox_core::{
    ClusterHandle, CoreError, DeploymentId, Operation, PortKind, Provider, SourceId,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A deployment record: one local cluster and its lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    /// Unique identifier, never reused.
    pub id: DeploymentId,
    /// User-supplied name.
    pub name: String,
    /// Owner email.
    pub owner: String,
    /// Sizing template.
    pub preset: Preset,
    /// Current lifecycle state.
    pub state: DeploymentState,
    /// Sizing the cluster runs with when active.
    pub node_spec: NodeSpec,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
    /// When the deployment expires, if ever.
    pub expires_at: Option<DateTime<Utc>>,
    /// Kubeconfig context targeting the cluster.
    pub kubeconfig_context: String,
    /// Handle from the provisioner, set once provisioning succeeds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterHandle>,
    /// Host port mapped to the cluster ingress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_port: Option<u16>,
    /// Host port mapped to the in-cluster `PostgreSQL`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgres_port: Option<u16>,
    /// Resource tags.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Why the deployment entered `failed`, if it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureDetail>,
    /// When the record was destroyed (soft delete).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destroyed_at: Option<DateTime<Utc>>,
}

impl Deployment {
    /// Host ports this record references, with the allocator namespace of each.
    #[must_use]
    pub fn ports(&self) -> Vec<(PortKind, u16)> {
        [self.ingress_port, self.postgres_port]
            .into_iter()
            .flatten()
            .map(|port| (PortKind::Ingress, port))
            .collect()
    }

    /// Returns true if `expires_at` has passed at `now`.
    #[must_use]
    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Time left until expiry, or `None` if the record never expires.
    #[must_use]
    pub fn time_remaining(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.expires_at.map(|at| at - now)
    }

    /// The ledger holder for this record's reservations.
    #[must_use]
    pub fn holder(&self) -> Holder {
        Holder::Deployment(self.id.clone())
    }
}

/// Why a deployment failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    /// Short machine-readable reason (e.g. `ExternalResourceMissing`).
    pub reason: String,
    /// Diagnostic text, including any collaborator output.
    pub message: String,
    /// When the failure was recorded.
    pub at: DateTime<Utc>,
}

/// Lifecycle states for a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    /// Cluster is being created.
    Provisioning,
    /// Cluster is up with its full sizing.
    Running,
    /// Workloads scaled to zero, cluster identity preserved.
    Stopped,
    /// Tear-down in progress.
    Destroying,
    /// Torn down; record retained for audit.
    Destroyed,
    /// An unrecoverable external error occurred.
    Failed,
    /// Torn down after `expires_at` elapsed.
    Expired,
}

impl DeploymentState {
    /// Returns true if no lifecycle transition other than `destroy` applies.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Destroyed | Self::Failed | Self::Expired)
    }

    /// Returns true if a record in this state claims its name.
    ///
    /// Failed records keep their name because their external resources may
    /// still exist under it.
    #[must_use]
    pub const fn holds_name(self) -> bool {
        matches!(
            self,
            Self::Provisioning | Self::Running | Self::Stopped | Self::Destroying | Self::Failed
        )
    }

    /// Returns true if a record in this state keeps its port reservations.
    #[must_use]
    pub const fn holds_ports(self) -> bool {
        matches!(
            self,
            Self::Provisioning | Self::Running | Self::Stopped | Self::Destroying
        )
    }

    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Destroying => "destroying",
            Self::Destroyed => "destroyed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provisioning" => Ok(Self::Provisioning),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "destroying" => Ok(Self::Destroying),
            "destroyed" => Ok(Self::Destroyed),
            "failed" => Ok(Self::Failed),
            "expired" => Ok(Self::Expired),
            other => Err(CoreError::UnknownVariant {
                kind: "state",
                value: other.to_string(),
            }),
        }
    }
}

/// A named resource-sizing template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Preset {
    /// Lightweight development cluster.
    #[default]
    Development,
    /// Higher-resource cluster for performance testing.
    Performance,
    /// Multi-node cluster for reproducing customer issues.
    CustomerReproduction,
}

impl Preset {
    /// All presets, in display order.
    pub const ALL: [Self; 3] = [
        Self::Development,
        Self::Performance,
        Self::CustomerReproduction,
    ];

    /// Sizing for this preset.
    #[must_use]
    pub fn node_spec(self) -> NodeSpec {
        let (workers, cpu, memory) = match self {
            Self::Development => (1, "2", "4Gi"),
            Self::Performance => (2, "4", "8Gi"),
            Self::CustomerReproduction => (3, "6", "12Gi"),
        };
        NodeSpec {
            control_planes: 1,
            workers,
            cpu: cpu.to_string(),
            memory: memory.to_string(),
        }
    }

    /// One-line description.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Development => "Lightweight development cluster",
            Self::Performance => "Higher resource cluster for performance testing",
            Self::CustomerReproduction => "Multi-node cluster for customer issue reproduction",
        }
    }

    /// Whether the preset runs the in-cluster `PostgreSQL` sidecar.
    #[must_use]
    pub const fn has_database(self) -> bool {
        true
    }

    /// Kebab-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Performance => "performance",
            Self::CustomerReproduction => "customer-reproduction",
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Preset {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| CoreError::UnknownVariant {
                kind: "preset",
                value: s.to_string(),
            })
    }
}

/// Node counts and per-node resources for a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Control-plane node count.
    pub control_planes: u32,
    /// Worker node count.
    pub workers: u32,
    /// CPU request per node.
    pub cpu: String,
    /// Memory request per node.
    pub memory: String,
}

/// A configured path to one shared remote data source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionProfile {
    /// Catalog name of the source.
    pub source_id: SourceId,
    /// Cloud hosting the source.
    pub provider: Provider,
    /// Bastion host the tunnel goes through.
    pub bastion_endpoint: String,
    /// Host the bastion forwards to.
    pub target_host: String,
    /// Local end of the tunnel.
    pub local_port: u16,
    /// Remote end of the tunnel.
    pub remote_port: u16,
    /// Opaque credential reference (never the secret).
    pub credentials_ref: String,
    /// Persisted status. Liveness is checked separately.
    pub status: ProfileStatus,
    /// Tunnel process id while one is supposed to be running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_pid: Option<u32>,
    /// When the current tunnel was started.
    pub enabled_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
    /// Why the profile degraded, if it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ConnectionProfile {
    /// The ledger holder for this profile's reservation.
    #[must_use]
    pub fn holder(&self) -> Holder {
        Holder::Connection(self.source_id.clone())
    }
}

/// Status of a connection profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileStatus {
    /// No tunnel configured.
    Disabled,
    /// Tunnel started and believed alive.
    Enabled,
    /// Tunnel process died; requires an explicit re-enable.
    Degraded,
}

impl ProfileStatus {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Enabled => "enabled",
            Self::Degraded => "degraded",
        }
    }
}

impl fmt::Display for ProfileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A shared data source reachable through a bastion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDefinition {
    /// Catalog name.
    pub source_id: SourceId,
    /// Cloud hosting the source.
    pub provider: Provider,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Bastion host.
    pub bastion_host: String,
    /// Host the bastion forwards to.
    pub target_host: String,
    /// Port of the source on the target host.
    pub remote_port: u16,
    /// Preferred local port for the tunnel.
    pub local_port: u16,
    /// Credential reference handed to the resolver.
    pub credentials_ref: String,
}

/// Record that references a ledger reservation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Holder {
    /// A deployment record.
    Deployment(DeploymentId),
    /// A connection profile.
    Connection(SourceId),
}

impl fmt::Display for Holder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deployment(id) => write!(f, "deployment:{id}"),
            Self::Connection(source) => write!(f, "connection:{source}"),
        }
    }
}

/// One reserved local port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Allocator namespace.
    pub kind: PortKind,
    /// Record holding the port.
    pub holder: Holder,
    /// When the reservation was made.
    pub reserved_at: DateTime<Utc>,
}

/// The set of currently reserved local ports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    /// Reservations keyed by port.
    #[serde(default)]
    pub reservations: BTreeMap<u16, Reservation>,
}

impl Ledger {
    /// Returns true if `port` is reserved by anyone.
    #[must_use]
    pub fn is_reserved(&self, port: u16) -> bool {
        self.reservations.contains_key(&port)
    }

    /// Reserve `port` for `holder`. Returns false if it is already reserved.
    pub fn reserve(
        &mut self,
        port: u16,
        kind: PortKind,
        holder: Holder,
        at: DateTime<Utc>,
    ) -> bool {
        if self.is_reserved(port) {
            return false;
        }
        self.reservations.insert(
            port,
            Reservation {
                kind,
                holder,
                reserved_at: at,
            },
        );
        true
    }

    /// Release `port`, returning the reservation that held it.
    pub fn release(&mut self, port: u16) -> Option<Reservation> {
        self.reservations.remove(&port)
    }

    /// Release every port `holder` has reserved, returning the ports.
    pub fn release_holder(&mut self, holder: &Holder) -> Vec<u16> {
        let ports = self.held_by(holder);
        for port in &ports {
            self.reservations.remove(port);
        }
        ports
    }

    /// Ports reserved by `holder`, ascending.
    #[must_use]
    pub fn held_by(&self, holder: &Holder) -> Vec<u16> {
        self.reservations
            .iter()
            .filter(|(_, r)| &r.holder == holder)
            .map(|(port, _)| *port)
            .collect()
    }
}

/// Result of a lifecycle event, as recorded in the usage log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The operation changed state.
    Ok,
    /// The operation failed.
    Failed,
    /// The operation was a no-op.
    Noop,
}

/// One line of the usage log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
    /// Invocation that produced the event.
    pub invocation_id: Uuid,
    /// Who ran the command.
    pub actor: String,
    /// What was attempted.
    pub operation: Operation,
    /// Deployment id or source id.
    pub entity: String,
    /// How it went.
    pub outcome: Outcome,
    /// Free-form detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
