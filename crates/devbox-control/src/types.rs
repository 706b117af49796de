//! Request and response types for controller operations.

use devbox_core::{DeploymentId, SourceId};
use devbox_store::{
    ConnectionProfile, DeploymentFilter, DeploymentState, Preset, ProfileStatus, SourceDefinition,
};
use serde::{Deserialize, Serialize};

/// Request to create a new deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRequest {
    /// User-supplied name.
    pub name: String,
    /// Sizing template. Uses the configured default if not provided.
    #[serde(default)]
    pub preset: Option<Preset>,
    /// Owner email. Uses the configured identity if not provided.
    #[serde(default)]
    pub owner: Option<String>,
    /// Time to live such as `1h` or `3d`. Uses the configured default if not
    /// provided.
    #[serde(default)]
    pub ttl: Option<String>,
}

impl CreateRequest {
    /// Create a new request with the given name and configured defaults.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            preset: None,
            owner: None,
            ttl: None,
        }
    }

    /// Use `preset` instead of the configured default.
    #[must_use]
    pub const fn with_preset(mut self, preset: Preset) -> Self {
        self.preset = Some(preset);
        self
    }

    /// Record `owner` instead of the configured identity.
    #[must_use]
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Expire after `ttl` instead of the configured default.
    #[must_use]
    pub fn with_ttl(mut self, ttl: impl Into<String>) -> Self {
        self.ttl = Some(ttl.into());
        self
    }
}

/// Filters for listing deployments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListFilter {
    /// Only records owned by this email.
    #[serde(default)]
    pub owner: Option<String>,
    /// Only records in this state.
    #[serde(default)]
    pub state: Option<DeploymentState>,
    /// Only active records expiring within the configured window.
    #[serde(default)]
    pub expiring_soon: bool,
    /// Include destroyed records.
    #[serde(default)]
    pub include_destroyed: bool,
}

impl ListFilter {
    /// Only records in `state`.
    #[must_use]
    pub const fn state(state: DeploymentState) -> Self {
        Self {
            owner: None,
            state: Some(state),
            expiring_soon: false,
            include_destroyed: false,
        }
    }

    pub(crate) fn store_filter(&self) -> DeploymentFilter {
        DeploymentFilter {
            owner: self.owner.clone(),
            state: self.state,
            name: None,
            include_destroyed: self.include_destroyed,
        }
    }
}

/// Live status of one data source.
#[derive(Debug, Clone, Serialize)]
pub struct ProfileInfo {
    /// Catalog name.
    pub source_id: SourceId,
    /// Catalog entry, if the source is still in the catalog.
    pub source: Option<SourceDefinition>,
    /// Persisted profile, if one exists.
    pub profile: Option<ConnectionProfile>,
    /// Observed status: `enabled` only if the tunnel process is alive.
    pub status: ProfileStatus,
}

impl ProfileInfo {
    /// Local port clients connect to, while enabled.
    #[must_use]
    pub fn local_port(&self) -> Option<u16> {
        self.profile
            .as_ref()
            .filter(|_| self.status == ProfileStatus::Enabled)
            .map(|p| p.local_port)
    }
}

/// What one reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Deployments torn down because `expires_at` passed.
    pub expired: Vec<DeploymentId>,
    /// Deployments moved to `failed` because their cluster is gone.
    pub failed: Vec<DeploymentId>,
    /// Stale `provisioning` records found running.
    pub resolved: Vec<DeploymentId>,
    /// Profiles whose tunnel process died.
    pub degraded: Vec<SourceId>,
    /// Ledger reservations released because no live record held them.
    pub released_ports: Vec<u16>,
    /// Entities skipped because another invocation held their lock.
    pub skipped: Vec<String>,
    /// Entities the pass could not reconcile, with the reason.
    pub errors: Vec<String>,
}

impl SweepReport {
    /// Returns true if the pass changed nothing and hit no problems.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.expired.is_empty()
            && self.failed.is_empty()
            && self.resolved.is_empty()
            && self.degraded.is_empty()
            && self.released_ports.is_empty()
            && self.skipped.is_empty()
            && self.errors.is_empty()
    }
}
