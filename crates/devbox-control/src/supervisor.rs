//! Tunnel supervisor.
//!
//! Owns connection profiles and the detached tunnel processes behind them.
//! The persisted status is never trusted on its own: every read checks the
//! recorded process and marks the profile `degraded` if it has died. A
//! degraded tunnel is not restarted; it must be enabled again explicitly.

use std::sync::Arc;

use async_trait::async_trait;
use devbox_core::{Operation, PortKind, ProcessHandle, SourceId};
use devbox_store::{
    keys, ConnectionProfile, Holder, LockKey, Outcome, ProfileStatus, SourceDefinition, Store,
};
use devbox_tunnel::{CredentialResolver, TunnelError, TunnelLauncher, TunnelRequest};
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::context::Context;
use crate::error::{ControlError, During, ErrorKind, Result};
use crate::types::ProfileInfo;

/// File in a source's directory that receives the tunnel's stderr.
pub const TUNNEL_LOG: &str = "tunnel.log";

/// Trait defining the data-source connectivity operations.
#[async_trait]
pub trait Connectivity: Send + Sync {
    /// Reserve a local port and start a tunnel to the source's bastion.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyEnabled` if the source's profile is enabled,
    /// `NotFound` if the source is not in the catalog, and
    /// `CollaboratorFailure` if the credential or the tunnel fails.
    async fn enable(&self, source_id: &SourceId) -> Result<ConnectionProfile>;

    /// Terminate the tunnel, release its port, and delete the profile.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the source has no profile.
    async fn disable(&self, source_id: &SourceId) -> Result<()>;

    /// Live status of one source.
    async fn info(&self, source_id: &SourceId) -> Result<ProfileInfo>;

    /// Live status of every source with a profile.
    async fn list(&self) -> Result<Vec<ProfileInfo>>;
}

/// Supervises tunnel processes for connection profiles.
pub struct TunnelSupervisor<S: Store, L: TunnelLauncher, R: CredentialResolver> {
    ctx: Context<S>,
    catalog: Catalog,
    launcher: Arc<L>,
    resolver: Arc<R>,
}

impl<S: Store, L: TunnelLauncher, R: CredentialResolver> Clone for TunnelSupervisor<S, L, R> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            catalog: self.catalog.clone(),
            launcher: Arc::clone(&self.launcher),
            resolver: Arc::clone(&self.resolver),
        }
    }
}

impl<S, L, R> TunnelSupervisor<S, L, R>
where
    S: Store + 'static,
    L: TunnelLauncher + 'static,
    R: CredentialResolver + 'static,
{
    /// Create a supervisor over the configured catalog.
    #[must_use]
    pub fn new(ctx: Context<S>, launcher: Arc<L>, resolver: Arc<R>) -> Self {
        let catalog = Catalog::from_config(ctx.config());
        Self {
            ctx,
            catalog,
            launcher,
            resolver,
        }
    }

    /// Get the invocation context.
    #[must_use]
    pub const fn context(&self) -> &Context<S> {
        &self.ctx
    }

    /// The same supervisor over `ctx`.
    #[must_use]
    pub fn with_context(&self, ctx: Context<S>) -> Self {
        Self { ctx, ..self.clone() }
    }

    /// The data sources this supervisor can reach.
    #[must_use]
    pub const fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    fn source(&self, operation: Operation, source_id: &SourceId) -> Result<SourceDefinition> {
        self.catalog
            .get(source_id)
            .cloned()
            .ok_or_else(|| ControlError::new(operation, source_id, ErrorKind::NotFound))
    }

    async fn release_port(&self, operation: Operation, source_id: &SourceId) -> Result<()> {
        let guard = self
            .ctx
            .lock(LockKey::Ledger, operation, source_id)
            .await?;
        let store = self.ctx.store();
        let mut ledger = store.load_ledger().during(operation, source_id)?;
        let released = ledger.release_holder(&Holder::Connection(source_id.clone()));
        if !released.is_empty() {
            store
                .save_ledger(&guard, &ledger)
                .during(operation, source_id)?;
            debug!(source_id = %source_id, ports = ?released, "Released tunnel port");
        }
        Ok(())
    }

    /// Return `profile` as observed: an enabled profile whose process is dead
    /// is persisted as `degraded` first. `None` if the profile disappeared.
    pub(crate) async fn observe(
        &self,
        profile: ConnectionProfile,
    ) -> Result<Option<ConnectionProfile>> {
        if profile.status != ProfileStatus::Enabled {
            return Ok(Some(profile));
        }
        let alive = match profile.tunnel_pid {
            Some(pid) => self.launcher.is_alive(ProcessHandle::from_raw(pid)).await,
            None => false,
        };
        if alive {
            return Ok(Some(profile));
        }
        self.degrade(&profile.source_id, profile.tunnel_pid).await
    }

    /// Mark a profile `degraded` and release its port, provided it is still
    /// enabled with the process `observed_pid`.
    async fn degrade(
        &self,
        source_id: &SourceId,
        observed_pid: Option<u32>,
    ) -> Result<Option<ConnectionProfile>> {
        let op = Operation::Degrade;
        let guard = self
            .ctx
            .lock(LockKey::Profile(source_id.clone()), op, source_id)
            .await?;
        let store = self.ctx.store();
        let Some(mut profile) = store.get_profile(source_id).during(op, source_id)? else {
            return Ok(None);
        };
        if profile.status != ProfileStatus::Enabled || profile.tunnel_pid != observed_pid {
            return Ok(Some(profile));
        }

        let message = observed_pid.map_or_else(
            || "no tunnel process recorded".to_string(),
            |pid| format!("tunnel process {pid} exited"),
        );
        profile.status = ProfileStatus::Degraded;
        profile.tunnel_pid = None;
        profile.updated_at = self.ctx.now();
        profile.last_error = Some(message.clone());
        store.put_profile(&guard, &profile).during(op, source_id)?;
        self.release_port(op, source_id).await?;

        warn!(source_id = %source_id, pid = ?observed_pid, "Tunnel died, profile degraded");
        self.ctx
            .record(op, source_id, Outcome::Ok, Some(message));
        Ok(Some(profile))
    }

    fn info_for(&self, source_id: &SourceId, profile: Option<ConnectionProfile>) -> ProfileInfo {
        ProfileInfo {
            source_id: source_id.clone(),
            source: self.catalog.get(source_id).cloned(),
            status: profile
                .as_ref()
                .map_or(ProfileStatus::Disabled, |p| p.status),
            profile,
        }
    }
}

#[async_trait]
impl<S, L, R> Connectivity for TunnelSupervisor<S, L, R>
where
    S: Store + 'static,
    L: TunnelLauncher + 'static,
    R: CredentialResolver + 'static,
{
    async fn enable(&self, source_id: &SourceId) -> Result<ConnectionProfile> {
        let op = Operation::Enable;
        let source = self.source(op, source_id)?;

        // Held across the tunnel start so a concurrent enable of the same
        // source waits and then sees this one's profile.
        let guard = self
            .ctx
            .lock(LockKey::Profile(source_id.clone()), op, source_id)
            .await?;
        let store = self.ctx.store();
        let existing = store.get_profile(source_id).during(op, source_id)?;
        if let Some(profile) = existing
            .as_ref()
            .filter(|p| p.status == ProfileStatus::Enabled)
        {
            return Err(ControlError::new(
                op,
                source_id,
                ErrorKind::AlreadyEnabled {
                    local_port: profile.local_port,
                },
            ));
        }

        let credential = self
            .resolver
            .resolve(&source.credentials_ref)
            .during(op, source_id)?;

        let now = self.ctx.now();
        let holder = Holder::Connection(source_id.clone());
        let local_port = {
            let ledger_guard = self.ctx.lock(LockKey::Ledger, op, source_id).await?;
            let mut ledger = store.load_ledger().during(op, source_id)?;
            ledger.release_holder(&holder);
            let port = self
                .ctx
                .allocator()
                .reserve(
                    &mut ledger,
                    PortKind::Tunnel,
                    Some(source.local_port),
                    &holder,
                    now,
                )
                .map_err(|kind| ControlError::new(op, source_id, kind))?;
            store
                .save_ledger(&ledger_guard, &ledger)
                .during(op, source_id)?;
            port
        };

        let request = TunnelRequest {
            bastion_host: source.bastion_host.clone(),
            target_host: source.target_host.clone(),
            local_port,
            remote_port: source.remote_port,
            log_path: Some(keys::source_dir(store.root(), source_id).join(TUNNEL_LOG)),
        };
        let handle = match self.launcher.start(&request, &credential).await {
            Ok(handle) => handle,
            Err(err) => {
                let message = tunnel_text(&err);
                warn!(source_id = %source_id, error = %message, "Tunnel failed to start");
                self.release_port(op, source_id)
                    .await
                    .map_err(ControlError::after_side_effects)?;
                if let Some(mut previous) = existing {
                    previous.last_error = Some(message.clone());
                    previous.updated_at = now;
                    if let Err(store_err) = store.put_profile(&guard, &previous) {
                        warn!(source_id = %source_id, error = %store_err, "Failed to record tunnel error");
                    }
                }
                self.ctx
                    .record(op, source_id, Outcome::Failed, Some(message));
                return Err(ControlError::new(op, source_id, err.into()));
            }
        };

        let profile = ConnectionProfile {
            source_id: source_id.clone(),
            provider: source.provider,
            bastion_endpoint: source.bastion_host,
            target_host: source.target_host,
            local_port,
            remote_port: source.remote_port,
            credentials_ref: source.credentials_ref,
            status: ProfileStatus::Enabled,
            tunnel_pid: Some(handle.raw()),
            enabled_at: now,
            updated_at: now,
            last_error: None,
        };
        if let Err(err) = store.put_profile(&guard, &profile) {
            if let Err(kill_err) = self
                .launcher
                .terminate(handle, self.ctx.config().tunnel_grace())
                .await
            {
                warn!(source_id = %source_id, error = %kill_err, "Failed to stop unrecorded tunnel");
            }
            self.release_port(op, source_id)
                .await
                .map_err(ControlError::after_side_effects)?;
            return Err(ControlError::new(op, source_id, err.into()).after_side_effects());
        }

        info!(
            source_id = %source_id,
            local_port,
            pid = handle.raw(),
            "Tunnel enabled"
        );
        self.ctx.record(
            op,
            source_id,
            Outcome::Ok,
            Some(format!("localhost:{local_port}")),
        );
        Ok(profile)
    }

    async fn disable(&self, source_id: &SourceId) -> Result<()> {
        let op = Operation::Disable;
        let guard = self
            .ctx
            .lock(LockKey::Profile(source_id.clone()), op, source_id)
            .await?;
        let store = self.ctx.store();
        let profile = store
            .get_profile(source_id)
            .during(op, source_id)?
            .ok_or_else(|| ControlError::new(op, source_id, ErrorKind::NotFound))?;

        if let Some(pid) = profile.tunnel_pid {
            self.launcher
                .terminate(
                    ProcessHandle::from_raw(pid),
                    self.ctx.config().tunnel_grace(),
                )
                .await
                .during(op, source_id)?;
        }
        store
            .delete_profile(&guard, source_id)
            .during(op, source_id)
            .map_err(ControlError::after_side_effects)?;
        self.release_port(op, source_id)
            .await
            .map_err(ControlError::after_side_effects)?;

        info!(source_id = %source_id, "Tunnel disabled");
        self.ctx.record(op, source_id, Outcome::Ok, None);
        Ok(())
    }

    async fn info(&self, source_id: &SourceId) -> Result<ProfileInfo> {
        let op = Operation::Info;
        let profile = self
            .ctx
            .store()
            .get_profile(source_id)
            .during(op, source_id)?;
        if profile.is_none() && self.catalog.get(source_id).is_none() {
            return Err(ControlError::new(op, source_id, ErrorKind::NotFound));
        }
        let observed = match profile {
            Some(profile) => self.observe(profile).await?,
            None => None,
        };
        Ok(self.info_for(source_id, observed))
    }

    async fn list(&self) -> Result<Vec<ProfileInfo>> {
        let profiles = self
            .ctx
            .store()
            .list_profiles()
            .during(Operation::List, "profiles")?;
        let mut infos = Vec::with_capacity(profiles.len());
        for profile in profiles {
            let source_id = profile.source_id.clone();
            let observed = self.observe(profile).await?;
            infos.push(self.info_for(&source_id, observed));
        }
        Ok(infos)
    }
}

/// The tunnel program's own error text.
fn tunnel_text(err: &TunnelError) -> String {
    err.tool_output()
        .map_or_else(|| err.to_string(), str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::usage::Invocation;
    use chrono::{TimeZone, Utc};
    use devbox_store::{DevboxConfig, FileStore, PortRanges};
    use devbox_tunnel::{CredentialError, MockCredentialResolver, MockTunnelLauncher};
    use std::time::Duration;
    use tempfile::TempDir;

    type Supervisor = TunnelSupervisor<FileStore, MockTunnelLauncher, MockCredentialResolver>;

    fn supervisor(resolver: MockCredentialResolver) -> (TempDir, Arc<MockTunnelLauncher>, Supervisor) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileStore::open(dir.path(), Duration::from_secs(2)).unwrap());
        let config = DevboxConfig {
            ports: PortRanges {
                probe_host: false,
                ..PortRanges::default()
            },
            ..DevboxConfig::default()
        };
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap(),
        ));
        let ctx = Context::new(store, config, clock, Invocation::new("test"));
        let launcher = Arc::new(MockTunnelLauncher::new());
        let supervisor = TunnelSupervisor::new(ctx, launcher.clone(), Arc::new(resolver));
        (dir, launcher, supervisor)
    }

    fn id(s: &str) -> SourceId {
        SourceId::parse(s).unwrap()
    }

    #[tokio::test]
    async fn enable_records_pid_and_port() {
        let (dir, launcher, sup) = supervisor(MockCredentialResolver::default());
        let profile = sup.enable(&id("aws-postgres")).await.unwrap();

        assert_eq!(profile.status, ProfileStatus::Enabled);
        assert_eq!(profile.local_port, 5432);
        assert!(profile.tunnel_pid.is_some());

        let started = launcher.started();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].target_host, "postgres-shared.platform.internal");
        assert_eq!(
            started[0].log_path.as_deref(),
            Some(dir.path().join("connectivity/aws-postgres/tunnel.log").as_path())
        );
    }

    #[tokio::test]
    async fn enable_twice_is_already_enabled() {
        let (_dir, _launcher, sup) = supervisor(MockCredentialResolver::default());
        sup.enable(&id("aws-postgres")).await.unwrap();
        let err = sup.enable(&id("aws-postgres")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AlreadyEnabled { local_port: 5432 });
        assert_eq!(err.operation, Operation::Enable);
    }

    #[tokio::test]
    async fn dead_tunnel_reports_degraded_and_frees_port() {
        let (_dir, launcher, sup) = supervisor(MockCredentialResolver::default());
        let profile = sup.enable(&id("aws-postgres")).await.unwrap();
        launcher.kill(ProcessHandle::from_raw(profile.tunnel_pid.unwrap()));

        let info = sup.info(&id("aws-postgres")).await.unwrap();
        assert_eq!(info.status, ProfileStatus::Degraded);
        assert_eq!(info.local_port(), None);
        assert!(sup.ctx.store().load_ledger().unwrap().reservations.is_empty());

        // No auto-restart; an explicit enable brings it back.
        assert_eq!(launcher.started().len(), 1);
        let again = sup.enable(&id("aws-postgres")).await.unwrap();
        assert_eq!(again.status, ProfileStatus::Enabled);
    }

    #[tokio::test]
    async fn disable_terminates_and_deletes() {
        let (_dir, launcher, sup) = supervisor(MockCredentialResolver::default());
        let profile = sup.enable(&id("aws-mysql")).await.unwrap();
        sup.disable(&id("aws-mysql")).await.unwrap();

        assert_eq!(launcher.terminated(), vec![profile.tunnel_pid.unwrap()]);
        assert_eq!(launcher.alive_count(), 0);
        let info = sup.info(&id("aws-mysql")).await.unwrap();
        assert_eq!(info.status, ProfileStatus::Disabled);
        assert!(sup.ctx.store().load_ledger().unwrap().reservations.is_empty());

        let err = sup.disable(&id("aws-mysql")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn start_failure_keeps_tool_text_and_releases_port() {
        let (_dir, launcher, sup) = supervisor(MockCredentialResolver::default());
        launcher.fail_start("Permission denied (publickey).");

        let err = sup.enable(&id("aws-postgres")).await.unwrap_err();
        assert_eq!(
            err.kind,
            ErrorKind::CollaboratorFailure {
                collaborator: "tunnel launcher",
                message: "Permission denied (publickey).".into(),
            }
        );
        assert!(sup.ctx.store().load_ledger().unwrap().reservations.is_empty());
        assert!(sup.ctx.store().get_profile(&id("aws-postgres")).unwrap().is_none());
    }

    #[tokio::test]
    async fn credential_failure_starts_nothing() {
        let (_dir, launcher, sup) = supervisor(MockCredentialResolver::failing(
            CredentialError::MissingEnv("BASTION_KEY".into()),
        ));
        let err = sup.enable(&id("aws-postgres")).await.unwrap_err();
        assert!(matches!(
            err.kind,
            ErrorKind::CollaboratorFailure {
                collaborator: "credential resolver",
                ..
            }
        ));
        assert!(launcher.started().is_empty());
    }

    #[tokio::test]
    async fn unknown_source_is_not_found() {
        let (_dir, _launcher, sup) = supervisor(MockCredentialResolver::default());
        let err = sup.enable(&id("oracle-prod")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        let err = sup.info(&id("oracle-prod")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn tunnels_get_distinct_ports() {
        let (_dir, _launcher, sup) = supervisor(MockCredentialResolver::default());
        let a = sup.enable(&id("aws-postgres")).await.unwrap();
        let b = sup.enable(&id("gcp-postgres")).await.unwrap();
        assert_ne!(a.local_port, b.local_port);

        let listed = sup.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|i| i.status == ProfileStatus::Enabled));
    }
}
