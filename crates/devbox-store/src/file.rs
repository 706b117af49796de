//! File-backed storage implementation.
//!
//! This module provides the `FileStore` implementation of the `Store` trait.
//! Every document is pretty-printed JSON written to a temporary file in the
//! destination directory and renamed over the previous version.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use devbox_core::{DeploymentId, SourceId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::config::DevboxConfig;
use crate::error::{Result, StoreError};
use crate::keys;
use crate::lock::{self, EntityLock, LockKey};
use crate::schema::{all_directories, layout};
use crate::types::{ConnectionProfile, Deployment, DeploymentState, Ledger, UsageEvent};
use crate::{DeploymentFilter, Store};

/// Store rooted at a directory on local disk.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    lock_timeout: Duration,
}

impl FileStore {
    /// Open or create a state root at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory layout cannot be created.
    pub fn open<P: AsRef<Path>>(root: P, lock_timeout: Duration) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in all_directories() {
            let path = root.join(dir);
            fs::create_dir_all(&path).map_err(|e| StoreError::io(&path, e))?;
        }
        tracing::debug!(root = %root.display(), "Opened state root");
        Ok(Self { root, lock_timeout })
    }

    /// Change the bound on lock acquisition.
    #[must_use]
    pub const fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(path, e)),
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| StoreError::Serialization {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
    }

    fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;

        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
        serde_json::to_writer_pretty(&mut tmp, value).map_err(|e| StoreError::Serialization {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        tmp.write_all(b"\n")
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| StoreError::io(tmp.path(), e))?;
        tmp.persist(path)
            .map_err(|e| StoreError::io(path, e.error))?;
        Ok(())
    }

    fn list_dir(&self, dir: &str) -> Result<Vec<String>> {
        let path = self.root.join(dir);
        let entries = match fs::read_dir(&path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&path, e))?;
            if entry.path().is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

impl Store for FileStore {
    fn root(&self) -> &Path {
        &self.root
    }

    fn lock(&self, key: LockKey) -> Result<EntityLock> {
        let path = keys::lock_path(&self.root, &key);
        lock::acquire(&path, key, self.lock_timeout)
    }

    fn lock_within(&self, key: LockKey, wait: Duration) -> Result<EntityLock> {
        let path = keys::lock_path(&self.root, &key);
        lock::acquire(&path, key, wait)
    }

    // =========================================================================
    // Deployment Operations
    // =========================================================================

    fn get_deployment(&self, id: &DeploymentId) -> Result<Option<Deployment>> {
        Self::read_json(&keys::metadata_path(&self.root, id))
    }

    fn put_deployment(&self, guard: &EntityLock, deployment: &Deployment) -> Result<()> {
        guard.ensure(&LockKey::Deployment(deployment.id.clone()))?;
        Self::write_atomic(&keys::metadata_path(&self.root, &deployment.id), deployment)?;
        tracing::trace!(deployment_id = %deployment.id, state = %deployment.state, "Wrote deployment");
        Ok(())
    }

    fn delete_deployment(
        &self,
        guard: &EntityLock,
        id: &DeploymentId,
        at: DateTime<Utc>,
    ) -> Result<Deployment> {
        guard.ensure(&LockKey::Deployment(id.clone()))?;
        let mut deployment = self
            .get_deployment(id)?
            .ok_or_else(|| StoreError::NotFound {
                entity: id.to_string(),
            })?;
        deployment.state = DeploymentState::Destroyed;
        deployment.updated_at = at;
        deployment.destroyed_at.get_or_insert(at);
        Self::write_atomic(&keys::metadata_path(&self.root, id), &deployment)?;
        Ok(deployment)
    }

    fn deployment_exists(&self, id: &DeploymentId) -> Result<bool> {
        Ok(keys::deployment_dir(&self.root, id).exists())
    }

    fn list_deployments(&self, filter: &DeploymentFilter) -> Result<Vec<Deployment>> {
        let mut deployments = Vec::new();
        for name in self.list_dir(layout::DEPLOYMENTS_DIR)? {
            let Ok(id) = DeploymentId::parse(&name) else {
                tracing::debug!(dir = %name, "Skipping foreign directory");
                continue;
            };
            match self.get_deployment(&id)? {
                Some(deployment) if filter.matches(&deployment) => deployments.push(deployment),
                Some(_) => {}
                None => tracing::debug!(deployment_id = %id, "Directory has no record"),
            }
        }
        deployments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(deployments)
    }

    // =========================================================================
    // Connection Profile Operations
    // =========================================================================

    fn get_profile(&self, source_id: &SourceId) -> Result<Option<ConnectionProfile>> {
        Self::read_json(&keys::profile_path(&self.root, source_id))
    }

    fn put_profile(&self, guard: &EntityLock, profile: &ConnectionProfile) -> Result<()> {
        guard.ensure(&LockKey::Profile(profile.source_id.clone()))?;
        Self::write_atomic(&keys::profile_path(&self.root, &profile.source_id), profile)
    }

    fn delete_profile(&self, guard: &EntityLock, source_id: &SourceId) -> Result<()> {
        guard.ensure(&LockKey::Profile(source_id.clone()))?;
        let path = keys::profile_path(&self.root, source_id);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    entity: source_id.to_string(),
                })
            }
            Err(e) => return Err(StoreError::io(&path, e)),
        }
        // Leaves the directory in place if anything else lives there.
        let _ = fs::remove_dir(keys::source_dir(&self.root, source_id));
        Ok(())
    }

    fn list_profiles(&self) -> Result<Vec<ConnectionProfile>> {
        let mut profiles = Vec::new();
        for name in self.list_dir(layout::CONNECTIVITY_DIR)? {
            let Ok(source_id) = SourceId::parse(&name) else {
                continue;
            };
            if let Some(profile) = self.get_profile(&source_id)? {
                profiles.push(profile);
            }
        }
        Ok(profiles)
    }

    // =========================================================================
    // Ledger Operations
    // =========================================================================

    fn load_ledger(&self) -> Result<Ledger> {
        Ok(Self::read_json(&self.root.join(layout::LEDGER_FILE))?.unwrap_or_default())
    }

    fn save_ledger(&self, guard: &EntityLock, ledger: &Ledger) -> Result<()> {
        guard.ensure(&LockKey::Ledger)?;
        Self::write_atomic(&self.root.join(layout::LEDGER_FILE), ledger)
    }

    // =========================================================================
    // Config Operations
    // =========================================================================

    fn load_config(&self) -> Result<DevboxConfig> {
        let config: DevboxConfig =
            Self::read_json(&self.root.join(layout::CONFIG_FILE))?.unwrap_or_default();
        config.validate()?;
        Ok(config)
    }

    fn save_config(&self, guard: &EntityLock, config: &DevboxConfig) -> Result<()> {
        guard.ensure(&LockKey::Config)?;
        config.validate()?;
        Self::write_atomic(&self.root.join(layout::CONFIG_FILE), config)
    }

    // =========================================================================
    // Usage Log
    // =========================================================================

    fn append_usage(&self, event: &UsageEvent) -> Result<()> {
        let path = keys::usage_path(&self.root, event.timestamp.date_naive());
        let mut line = serde_json::to_vec(event).map_err(|e| StoreError::Serialization {
            path: path.clone(),
            message: e.to_string(),
        })?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        file.write_all(&line).map_err(|e| StoreError::io(&path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Outcome, Preset, ProfileStatus};
    use devbox_core::{Operation, Provider};
    use std::collections::BTreeMap;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn create_test_store() -> (FileStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path(), Duration::from_millis(100)).unwrap();
        (store, dir)
    }

    fn test_deployment(id: &str, name: &str, owner: &str) -> Deployment {
        let now = Utc::now();
        Deployment {
            id: DeploymentId::parse(id).unwrap(),
            name: name.to_string(),
            owner: owner.to_string(),
            preset: Preset::Development,
            state: DeploymentState::Running,
            node_spec: Preset::Development.node_spec(),
            created_at: now,
            updated_at: now,
            expires_at: None,
            kubeconfig_context: format!("kind-{id}"),
            cluster: None,
            ingress_port: Some(30000),
            postgres_port: Some(30001),
            tags: BTreeMap::new(),
            failure: None,
            destroyed_at: None,
        }
    }

    fn test_profile(source: &str) -> ConnectionProfile {
        let now = Utc::now();
        ConnectionProfile {
            source_id: SourceId::parse(source).unwrap(),
            provider: Provider::Aws,
            bastion_endpoint: "bastion-aws.platform.internal".into(),
            target_host: "postgres-aws.platform.internal".into(),
            local_port: 5432,
            remote_port: 5432,
            credentials_ref: "ssh-key:~/.ssh/platform_bastion_key".into(),
            status: ProfileStatus::Enabled,
            tunnel_pid: Some(4242),
            enabled_at: now,
            updated_at: now,
            last_error: None,
        }
    }

    #[test]
    fn deployment_crud() {
        let (store, _dir) = create_test_store();
        let deployment = test_deployment("ops-dev-1019", "dev", "ops@example.com");

        let guard = store.lock(LockKey::Deployment(deployment.id.clone())).unwrap();
        store.put_deployment(&guard, &deployment).unwrap();

        let fetched = store.get_deployment(&deployment.id).unwrap().unwrap();
        assert_eq!(fetched.name, "dev");
        assert_eq!(fetched.postgres_port, Some(30001));
        assert!(store.deployment_exists(&deployment.id).unwrap());

        let deleted = store
            .delete_deployment(&guard, &deployment.id, Utc::now())
            .unwrap();
        assert_eq!(deleted.state, DeploymentState::Destroyed);
        assert!(deleted.destroyed_at.is_some());

        let retained = store.get_deployment(&deployment.id).unwrap().unwrap();
        assert_eq!(retained.state, DeploymentState::Destroyed);
    }

    #[test]
    fn missing_deployment_is_none() {
        let (store, _dir) = create_test_store();
        let id = DeploymentId::parse("nobody-1019").unwrap();
        assert!(store.get_deployment(&id).unwrap().is_none());
        assert!(!store.deployment_exists(&id).unwrap());
    }

    #[test]
    fn put_requires_matching_lock() {
        let (store, _dir) = create_test_store();
        let deployment = test_deployment("ops-dev-1019", "dev", "ops@example.com");

        let wrong = store.lock(LockKey::Ledger).unwrap();
        let err = store.put_deployment(&wrong, &deployment).unwrap_err();
        assert!(matches!(err, StoreError::LockNotHeld { .. }));
        assert!(store.get_deployment(&deployment.id).unwrap().is_none());
    }

    #[test]
    fn concurrent_lock_is_busy() {
        let (store, _dir) = create_test_store();
        let id = DeploymentId::parse("ops-dev-1019").unwrap();

        let _held = store.lock(LockKey::Deployment(id.clone())).unwrap();
        let err = store.lock(LockKey::Deployment(id)).unwrap_err();
        assert!(err.is_busy());

        // Unrelated entities do not contend.
        let other = DeploymentId::parse("ops-api-1019").unwrap();
        assert!(store.lock(LockKey::Deployment(other)).is_ok());
    }

    #[test]
    fn zero_wait_lock_does_not_wait() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path(), Duration::from_secs(30)).unwrap();
        let _held = store.lock(LockKey::Ledger).unwrap();

        let started = std::time::Instant::now();
        let err = store.lock_within(LockKey::Ledger, Duration::ZERO).unwrap_err();
        assert!(err.is_busy());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn list_filters_and_orders() {
        let (store, _dir) = create_test_store();

        let mut first = test_deployment("ops-a-1019", "a", "ops@example.com");
        first.created_at -= chrono::Duration::hours(2);
        let mut second = test_deployment("jane-b-1019", "b", "jane@example.com");
        second.state = DeploymentState::Stopped;
        let mut gone = test_deployment("ops-c-1019", "c", "ops@example.com");
        gone.state = DeploymentState::Destroyed;

        for d in [&second, &gone, &first] {
            let guard = store.lock(LockKey::Deployment(d.id.clone())).unwrap();
            store.put_deployment(&guard, d).unwrap();
        }

        let all = store.list_deployments(&DeploymentFilter::default()).unwrap();
        let ids: Vec<_> = all.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["ops-a-1019", "jane-b-1019"]);

        let with_destroyed = store
            .list_deployments(&DeploymentFilter {
                include_destroyed: true,
                ..DeploymentFilter::default()
            })
            .unwrap();
        assert_eq!(with_destroyed.len(), 3);

        let by_owner = store
            .list_deployments(&DeploymentFilter {
                owner: Some("jane@example.com".into()),
                ..DeploymentFilter::default()
            })
            .unwrap();
        assert_eq!(by_owner.len(), 1);

        let stopped = store
            .list_deployments(&DeploymentFilter {
                state: Some(DeploymentState::Stopped),
                ..DeploymentFilter::default()
            })
            .unwrap();
        assert_eq!(stopped[0].id.as_str(), "jane-b-1019");
    }

    #[test]
    fn profile_crud() {
        let (store, _dir) = create_test_store();
        let profile = test_profile("aws-postgres");

        let guard = store.lock(LockKey::Profile(profile.source_id.clone())).unwrap();
        store.put_profile(&guard, &profile).unwrap();
        assert_eq!(store.list_profiles().unwrap().len(), 1);

        store.delete_profile(&guard, &profile.source_id).unwrap();
        assert!(store.get_profile(&profile.source_id).unwrap().is_none());
        assert!(matches!(
            store.delete_profile(&guard, &profile.source_id),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn ledger_persists() {
        let (store, _dir) = create_test_store();
        assert!(store.load_ledger().unwrap().reservations.is_empty());

        let mut ledger = Ledger::default();
        let holder = test_profile("aws-postgres").holder();
        ledger.reserve(5432, devbox_core::PortKind::Tunnel, holder.clone(), Utc::now());

        let guard = store.lock(LockKey::Ledger).unwrap();
        store.save_ledger(&guard, &ledger).unwrap();
        assert_eq!(store.load_ledger().unwrap().held_by(&holder), vec![5432]);
    }

    #[test]
    fn config_defaults_and_roundtrip() {
        let (store, _dir) = create_test_store();
        assert_eq!(store.load_config().unwrap(), DevboxConfig::default());

        let mut config = DevboxConfig::default();
        config.user_profile.email = Some("ops@example.com".into());
        let guard = store.lock(LockKey::Config).unwrap();
        store.save_config(&guard, &config).unwrap();
        assert_eq!(store.load_config().unwrap().owner_email(), Some("ops@example.com"));
    }

    #[test]
    fn usage_appends_lines() {
        let (store, dir) = create_test_store();
        let invocation_id = Uuid::new_v4();
        for operation in [Operation::Create, Operation::Stop] {
            store
                .append_usage(&UsageEvent {
                    timestamp: Utc::now(),
                    invocation_id,
                    actor: "ops@example.com".into(),
                    operation,
                    entity: "ops-dev-1019".into(),
                    outcome: Outcome::Ok,
                    detail: None,
                })
                .unwrap();
        }

        let log = keys::usage_path(dir.path(), Utc::now().date_naive());
        let contents = fs::read_to_string(log).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("\"stop\""));
    }
}
