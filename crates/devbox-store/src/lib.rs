//! File-backed metadata store for devbox.
//!
//! This crate provides durable storage for deployment records, connection
//! profiles, the port allocation ledger, the configuration document, and the
//! usage log. There is no server: every invocation of the tool opens the same
//! state root, so mutual exclusion is provided by per-entity file locks.
//!
//! # Guarantees
//!
//! - Writes are atomic: a document is written to a temporary file next to its
//!   destination and renamed over it. Readers see the old or the new document.
//! - Mutations require an [`EntityLock`] for the entity being written, acquired
//!   with a bounded wait. Contention past the bound is [`StoreError::Busy`].
//! - Deployments are soft-deleted and kept for audit; their ids are never reused.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use devbox_store::{DeploymentFilter, FileStore, Store};
//!
//! let store = FileStore::open("/tmp/devbox-state", Duration::from_secs(10)).unwrap();
//! let active = store.list_deployments(&DeploymentFilter::default()).unwrap();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod file;
pub mod keys;
pub mod lock;
pub mod schema;
pub mod types;

pub use config::{DevboxConfig, PortRanges, UserProfile};
pub use error::{Result, StoreError};
pub use file::FileStore;
pub use lock::{EntityLock, LockKey};
pub use types::{
    ConnectionProfile, Deployment, DeploymentState, FailureDetail, Holder, Ledger, NodeSpec,
    Outcome, Preset, ProfileStatus, Reservation, SourceDefinition, UsageEvent,
};

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use devbox_core::{DeploymentId, SourceId};

/// Criteria for listing deployments.
#[derive(Debug, Clone, Default)]
pub struct DeploymentFilter {
    /// Only records owned by this email.
    pub owner: Option<String>,
    /// Only records in this state.
    pub state: Option<DeploymentState>,
    /// Only records with this name (case-insensitive).
    pub name: Option<String>,
    /// Include soft-deleted records.
    pub include_destroyed: bool,
}

impl DeploymentFilter {
    /// Returns true if `deployment` passes every criterion.
    #[must_use]
    pub fn matches(&self, deployment: &Deployment) -> bool {
        if !self.include_destroyed
            && deployment.state == DeploymentState::Destroyed
            && self.state != Some(DeploymentState::Destroyed)
        {
            return false;
        }
        if let Some(owner) = &self.owner {
            if !deployment.owner.eq_ignore_ascii_case(owner) {
                return false;
            }
        }
        if let Some(state) = self.state {
            if deployment.state != state {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if !deployment.name.eq_ignore_ascii_case(name) {
                return false;
            }
        }
        true
    }
}

/// The storage trait defining all state-root operations.
///
/// This trait abstracts the storage layer so the business logic can be
/// exercised against any root directory. Reads take no lock; every mutation
/// takes the guard for the entity it writes and fails with
/// [`StoreError::LockNotHeld`] if the guard is for something else.
pub trait Store: Send + Sync {
    /// Directory holding all state.
    fn root(&self) -> &Path;

    /// Acquire the exclusive lock for an entity, waiting up to the store's bound.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Busy` if another holder keeps the lock past the bound.
    fn lock(&self, key: LockKey) -> Result<EntityLock>;

    /// Acquire the exclusive lock for an entity, waiting at most `wait`.
    /// A zero wait tries once.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Busy` if the lock is still held after `wait`.
    fn lock_within(&self, key: LockKey, wait: Duration) -> Result<EntityLock>;

    // =========================================================================
    // Deployment Operations
    // =========================================================================

    /// Get a deployment by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read or parsed.
    fn get_deployment(&self, id: &DeploymentId) -> Result<Option<Deployment>>;

    /// Create or atomically replace a deployment record.
    ///
    /// # Errors
    ///
    /// Returns an error if `guard` is not the deployment's lock or the write fails.
    fn put_deployment(&self, guard: &EntityLock, deployment: &Deployment) -> Result<()>;

    /// Soft-delete a deployment: mark it `destroyed` and keep it for audit.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the deployment doesn't exist.
    fn delete_deployment(
        &self,
        guard: &EntityLock,
        id: &DeploymentId,
        at: DateTime<Utc>,
    ) -> Result<Deployment>;

    /// Returns true if any record, including a destroyed one, uses this ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the state root cannot be inspected.
    fn deployment_exists(&self, id: &DeploymentId) -> Result<bool>;

    /// List deployments matching `filter`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if any record cannot be read or parsed.
    fn list_deployments(&self, filter: &DeploymentFilter) -> Result<Vec<Deployment>>;

    // =========================================================================
    // Connection Profile Operations
    // =========================================================================

    /// Get a connection profile by source ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the profile cannot be read or parsed.
    fn get_profile(&self, source_id: &SourceId) -> Result<Option<ConnectionProfile>>;

    /// Create or atomically replace a connection profile.
    ///
    /// # Errors
    ///
    /// Returns an error if `guard` is not the profile's lock or the write fails.
    fn put_profile(&self, guard: &EntityLock, profile: &ConnectionProfile) -> Result<()>;

    /// Delete a connection profile.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the profile doesn't exist.
    fn delete_profile(&self, guard: &EntityLock, source_id: &SourceId) -> Result<()>;

    /// List every connection profile.
    ///
    /// # Errors
    ///
    /// Returns an error if any profile cannot be read or parsed.
    fn list_profiles(&self) -> Result<Vec<ConnectionProfile>>;

    // =========================================================================
    // Ledger Operations
    // =========================================================================

    /// Read the allocation ledger. A missing ledger is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read or parsed.
    fn load_ledger(&self) -> Result<Ledger>;

    /// Atomically replace the allocation ledger.
    ///
    /// # Errors
    ///
    /// Returns an error if `guard` is not the ledger lock or the write fails.
    fn save_ledger(&self, guard: &EntityLock, ledger: &Ledger) -> Result<()>;

    // =========================================================================
    // Config Operations
    // =========================================================================

    /// Read the configuration document, falling back to defaults if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is unreadable or inconsistent.
    fn load_config(&self) -> Result<DevboxConfig>;

    /// Atomically replace the configuration document.
    ///
    /// # Errors
    ///
    /// Returns an error if `guard` is not the config lock, the document is
    /// inconsistent, or the write fails.
    fn save_config(&self, guard: &EntityLock, config: &DevboxConfig) -> Result<()>;

    // =========================================================================
    // Usage Log
    // =========================================================================

    /// Append one event to the day's usage log.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be written.
    fn append_usage(&self, event: &UsageEvent) -> Result<()>;
}
