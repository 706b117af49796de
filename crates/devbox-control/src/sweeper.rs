//! Reconciliation pass.
//!
//! Nothing runs between invocations, so every command starts with a sweep
//! that converges stored state with the world:
//!
//! - active deployments past `expires_at` are torn down to `expired`
//! - active deployments whose cluster has vanished move to `failed`
//! - `provisioning` records older than the provisioning bound are resolved
//! - `destroying` records left by an interrupted tear-down are finished
//! - enabled profiles whose tunnel died move to `degraded`
//! - ledger reservations no live record accounts for are released
//!
//! Every change is made under the entity's lock. Locks are taken with a short
//! wait; an entity whose lock is held elsewhere is skipped and picked up by
//! the next pass. A live invocation holds a deployment's lock for the whole
//! of its operation, so a `destroying` record whose lock is free was
//! abandoned.

use std::time::Duration;

use devbox_core::{DeploymentId, Operation};
use devbox_provision::ClusterProvisioner;
use devbox_store::{
    Deployment, DeploymentFilter, DeploymentState, EntityLock, Holder, LockKey, Outcome,
    ProfileStatus, Store,
};
use devbox_tunnel::{CredentialResolver, TunnelLauncher};
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::error::{ControlError, During, ErrorKind, Result};
use crate::service::LifecycleController;
use crate::supervisor::TunnelSupervisor;
use crate::types::SweepReport;

/// Longest the sweeper waits for any one lock.
pub const SWEEP_LOCK_WAIT: Duration = Duration::from_millis(200);

/// Runs reconciliation passes over every deployment, profile and reservation.
pub struct Sweeper<S, P, L, R>
where
    S: Store,
    P: ClusterProvisioner,
    L: TunnelLauncher,
    R: CredentialResolver,
{
    controller: LifecycleController<S, P>,
    supervisor: TunnelSupervisor<S, L, R>,
}

impl<S, P, L, R> Sweeper<S, P, L, R>
where
    S: Store + 'static,
    P: ClusterProvisioner + 'static,
    L: TunnelLauncher + 'static,
    R: CredentialResolver + 'static,
{
    /// Create a sweeper over the contexts of `controller` and `supervisor`,
    /// with lock waits capped at [`SWEEP_LOCK_WAIT`].
    #[must_use]
    pub fn new(
        controller: LifecycleController<S, P>,
        supervisor: TunnelSupervisor<S, L, R>,
    ) -> Self {
        let wait = SWEEP_LOCK_WAIT.min(controller.context().config().lock_timeout());
        let ctx = controller.context().with_lock_wait(wait);
        let controller = controller.with_context(ctx);
        let ctx = supervisor.context().with_lock_wait(wait);
        let supervisor = supervisor.with_context(ctx);
        Self {
            controller,
            supervisor,
        }
    }

    fn ctx(&self) -> &Context<S> {
        self.controller.context()
    }

    /// Run one pass. Per-entity problems are collected in the report rather
    /// than aborting the pass.
    pub async fn run(&self) -> SweepReport {
        let mut report = SweepReport::default();

        match self
            .ctx()
            .store()
            .list_deployments(&DeploymentFilter::default())
            .during(Operation::Sweep, "deployments")
        {
            Ok(records) => {
                for record in records {
                    if let Err(err) = self.sweep_deployment(record, &mut report).await {
                        note(&mut report, &err);
                    }
                }
            }
            Err(err) => note(&mut report, &err),
        }

        if let Err(err) = self.sweep_profiles(&mut report).await {
            note(&mut report, &err);
        }
        if let Err(err) = self.repair_ledger(&mut report).await {
            note(&mut report, &err);
        }

        if report.is_empty() {
            debug!("Sweep found nothing to do");
        } else {
            info!(
                expired = report.expired.len(),
                failed = report.failed.len(),
                resolved = report.resolved.len(),
                degraded = report.degraded.len(),
                released = report.released_ports.len(),
                skipped = report.skipped.len(),
                errors = report.errors.len(),
                "Sweep complete"
            );
        }
        report
    }

    fn is_stale_provisioning(&self, record: &Deployment) -> bool {
        record.state == DeploymentState::Provisioning
            && self.ctx().now() - record.updated_at > self.ctx().config().provision_timeout()
    }

    async fn sweep_deployment(&self, record: Deployment, report: &mut SweepReport) -> Result<()> {
        let candidate = match record.state {
            DeploymentState::Provisioning => self.is_stale_provisioning(&record),
            DeploymentState::Running | DeploymentState::Stopped | DeploymentState::Destroying => {
                true
            }
            _ => false,
        };
        if !candidate {
            return Ok(());
        }

        let op = Operation::Sweep;
        let (guard, record) = self.controller.lock_record(op, &record.id).await?;
        let id = record.id.clone();
        let now = self.ctx().now();
        match record.state {
            DeploymentState::Provisioning if self.is_stale_provisioning(&record) => {
                let handle = LifecycleController::<S, P>::cluster_handle(&record);
                let exists = self
                    .controller
                    .provisioner()
                    .exists(&handle)
                    .await
                    .during(op, &id)?;
                if exists {
                    self.controller
                        .transition(&guard, op, &id, DeploymentState::Running, false, move |r| {
                            r.kubeconfig_context.clone_from(&handle.context);
                            r.cluster = Some(handle);
                        })
                        .await?;
                    info!(deployment_id = %id, "Resolved stale provisioning record as running");
                    self.ctx().record(
                        op,
                        &id,
                        Outcome::Ok,
                        Some("stale provisioning resolved as running".to_string()),
                    );
                    report.resolved.push(id);
                } else {
                    self.missing(
                        &guard,
                        &id,
                        "provisioning never completed and no cluster exists",
                        report,
                    )
                    .await?;
                }
            }
            DeploymentState::Running | DeploymentState::Stopped if record.is_past_expiry(now) => {
                info!(deployment_id = %id, "Deployment expired, tearing down");
                self.controller
                    .tear_down(&guard, Operation::Expire, record, DeploymentState::Expired)
                    .await?;
                report.expired.push(id);
            }
            DeploymentState::Running | DeploymentState::Stopped => {
                let handle = LifecycleController::<S, P>::cluster_handle(&record);
                let exists = self
                    .controller
                    .provisioner()
                    .exists(&handle)
                    .await
                    .during(op, &id)?;
                if !exists {
                    let message = format!("cluster {} no longer exists", handle.cluster_name);
                    self.missing(&guard, &id, &message, report).await?;
                }
            }
            DeploymentState::Destroying => {
                self.finish_destroy(&guard, record, report).await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Finish a tear-down whose invocation went away: tear the cluster down
    /// again if it is still there, then land `destroyed`.
    async fn finish_destroy(
        &self,
        guard: &EntityLock,
        record: Deployment,
        report: &mut SweepReport,
    ) -> Result<()> {
        let op = Operation::Sweep;
        let id = record.id.clone();
        let handle = LifecycleController::<S, P>::cluster_handle(&record);
        let exists = self
            .controller
            .provisioner()
            .exists(&handle)
            .await
            .during(op, &id)?;
        if exists {
            warn!(deployment_id = %id, "Resuming interrupted tear-down");
            self.controller
                .tear_down(guard, Operation::Destroy, record, DeploymentState::Destroyed)
                .await?;
        } else {
            self.controller
                .transition(guard, op, &id, DeploymentState::Destroyed, true, |_| {})
                .await?;
            info!(deployment_id = %id, "Interrupted tear-down had completed, marked destroyed");
            self.ctx().record(
                op,
                &id,
                Outcome::Ok,
                Some("interrupted tear-down resolved as destroyed".to_string()),
            );
        }
        report.resolved.push(id);
        Ok(())
    }

    async fn missing(
        &self,
        guard: &EntityLock,
        id: &DeploymentId,
        message: &str,
        report: &mut SweepReport,
    ) -> Result<()> {
        let op = Operation::Sweep;
        self.controller
            .fail(guard, op, id, "ExternalResourceMissing", message)
            .await?;
        self.ctx()
            .record(op, id, Outcome::Failed, Some(message.to_string()));
        report.failed.push(id.clone());
        Ok(())
    }

    async fn sweep_profiles(&self, report: &mut SweepReport) -> Result<()> {
        let profiles = self
            .ctx()
            .store()
            .list_profiles()
            .during(Operation::Sweep, "profiles")?;
        for profile in profiles {
            if profile.status != ProfileStatus::Enabled {
                continue;
            }
            let source_id = profile.source_id.clone();
            match self.supervisor.observe(profile).await {
                Ok(Some(observed)) if observed.status == ProfileStatus::Degraded => {
                    report.degraded.push(source_id);
                }
                Ok(_) => {}
                Err(err) => note(report, &err),
            }
        }
        Ok(())
    }

    /// Release reservations whose holder is gone, is no longer active, or no
    /// longer references the port. Candidates are re-checked under the
    /// holder's lock and then the ledger lock.
    async fn repair_ledger(&self, report: &mut SweepReport) -> Result<()> {
        let op = Operation::Sweep;
        let store = self.ctx().store();
        let ledger = store.load_ledger().during(op, "ledger")?;
        let mut candidates = Vec::new();
        for (port, reservation) in &ledger.reservations {
            if self.is_orphaned(*port, &reservation.holder)? {
                candidates.push((*port, reservation.holder.clone()));
            }
        }

        for (port, holder) in candidates {
            if let Err(err) = self.release_orphan(port, &holder, report).await {
                note(report, &err);
            }
        }
        Ok(())
    }

    async fn release_orphan(
        &self,
        port: u16,
        holder: &Holder,
        report: &mut SweepReport,
    ) -> Result<()> {
        let op = Operation::Sweep;
        let key = match holder {
            Holder::Deployment(id) => LockKey::Deployment(id.clone()),
            Holder::Connection(source_id) => LockKey::Profile(source_id.clone()),
        };
        let _entity = self.ctx().lock(key, op, holder).await?;
        let guard = self.ctx().lock(LockKey::Ledger, op, holder).await?;

        let store = self.ctx().store();
        let mut ledger = store.load_ledger().during(op, holder)?;
        let still_held = ledger
            .reservations
            .get(&port)
            .is_some_and(|r| &r.holder == holder);
        if still_held && self.is_orphaned(port, holder)? {
            ledger.release(port);
            store.save_ledger(&guard, &ledger).during(op, holder)?;
            warn!(port, holder = %holder, "Released orphaned port reservation");
            report.released_ports.push(port);
        }
        Ok(())
    }

    fn is_orphaned(&self, port: u16, holder: &Holder) -> Result<bool> {
        let op = Operation::Sweep;
        let store = self.ctx().store();
        let orphaned = match holder {
            Holder::Deployment(id) => match store.get_deployment(id).during(op, id)? {
                Some(record) => {
                    !record.state.holds_ports() || !record.ports().iter().any(|(_, p)| *p == port)
                }
                None => true,
            },
            Holder::Connection(source_id) => {
                match store.get_profile(source_id).during(op, source_id)? {
                    Some(profile) => {
                        profile.status != ProfileStatus::Enabled || profile.local_port != port
                    }
                    None => true,
                }
            }
        };
        Ok(orphaned)
    }
}

/// File a per-entity error under skipped or errors.
fn note(report: &mut SweepReport, err: &ControlError) {
    match &err.kind {
        ErrorKind::Busy(_) => {
            debug!(entity = %err.entity, "Entity busy, skipped by sweep");
            report.skipped.push(err.entity.clone());
        }
        // Another invocation moved the record on between our read and lock.
        ErrorKind::InvalidState { .. } | ErrorKind::NotFound => {
            debug!(entity = %err.entity, error = %err, "Entity changed during sweep");
        }
        _ => {
            warn!(error = %err, "Sweep could not reconcile entity");
            report.errors.push(err.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::service::Lifecycle;
    use crate::supervisor::Connectivity;
    use crate::types::CreateRequest;
    use crate::usage::Invocation;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use devbox_core::{PortKind, ProcessHandle, SourceId};
    use devbox_provision::MockProvisioner;
    use devbox_store::{DevboxConfig, FileStore, PortRanges, UserProfile};
    use devbox_tunnel::{MockCredentialResolver, MockTunnelLauncher};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        clock: Arc<ManualClock>,
        provisioner: Arc<MockProvisioner>,
        launcher: Arc<MockTunnelLauncher>,
        controller: LifecycleController<FileStore, MockProvisioner>,
        supervisor: TunnelSupervisor<FileStore, MockTunnelLauncher, MockCredentialResolver>,
        sweeper: Sweeper<FileStore, MockProvisioner, MockTunnelLauncher, MockCredentialResolver>,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileStore::open(dir.path(), Duration::from_secs(2)).unwrap());
        let config = DevboxConfig {
            user_profile: UserProfile {
                email: Some("jane.doe@example.com".into()),
                ..UserProfile::default()
            },
            ports: PortRanges {
                probe_host: false,
                ..PortRanges::default()
            },
            ..DevboxConfig::default()
        };
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap(),
        ));
        let ctx = Context::new(store, config, clock.clone(), Invocation::new("test"));
        let provisioner = Arc::new(MockProvisioner::new());
        let launcher = Arc::new(MockTunnelLauncher::new());
        let controller = LifecycleController::new(ctx.clone(), provisioner.clone());
        let supervisor = TunnelSupervisor::new(
            ctx,
            launcher.clone(),
            Arc::new(MockCredentialResolver::default()),
        );
        let sweeper = Sweeper::new(controller.clone(), supervisor.clone());
        Harness {
            _dir: dir,
            clock,
            provisioner,
            launcher,
            controller,
            supervisor,
            sweeper,
        }
    }

    #[tokio::test]
    async fn quiet_pass_changes_nothing() {
        let h = harness();
        h.controller.create(CreateRequest::new("dev")).await.unwrap();
        assert!(h.sweeper.run().await.is_empty());
    }

    #[tokio::test]
    async fn expired_deployment_is_torn_down() {
        let h = harness();
        let record = h
            .controller
            .create(CreateRequest::new("dev").with_ttl("1h"))
            .await
            .unwrap();
        h.clock.advance(ChronoDuration::minutes(61));

        let report = h.sweeper.run().await;
        assert_eq!(report.expired, vec![record.id.clone()]);

        let swept = h.controller.get(&record.id).await.unwrap();
        assert_eq!(swept.state, DeploymentState::Expired);
        assert_eq!(h.provisioner.cluster_count(), 0);
        let store = h.controller.context().store();
        assert!(store.load_ledger().unwrap().reservations.is_empty());
    }

    #[tokio::test]
    async fn vanished_cluster_fails_deployment() {
        let h = harness();
        let record = h.controller.create(CreateRequest::new("dev")).await.unwrap();
        h.provisioner.remove_externally(record.id.as_str());

        let report = h.sweeper.run().await;
        assert_eq!(report.failed, vec![record.id.clone()]);
        let failed = h.controller.get(&record.id).await.unwrap();
        assert_eq!(failed.state, DeploymentState::Failed);
        assert_eq!(failed.failure.unwrap().reason, "ExternalResourceMissing");
    }

    #[tokio::test]
    async fn dead_tunnel_is_degraded() {
        let h = harness();
        let source = SourceId::parse("aws-postgres").unwrap();
        let profile = h.supervisor.enable(&source).await.unwrap();
        h.launcher
            .kill(ProcessHandle::from_raw(profile.tunnel_pid.unwrap()));

        let report = h.sweeper.run().await;
        assert_eq!(report.degraded, vec![source.clone()]);
        let stored = h
            .controller
            .context()
            .store()
            .get_profile(&source)
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, ProfileStatus::Degraded);
    }

    #[tokio::test]
    async fn orphaned_reservation_is_released() {
        let h = harness();
        let ctx = h.controller.context();
        let ghost = Holder::Deployment(DeploymentId::parse("ghost-1019").unwrap());
        {
            let guard = ctx.store().lock(LockKey::Ledger).unwrap();
            let mut ledger = ctx.store().load_ledger().unwrap();
            assert!(ledger.reserve(30_500, PortKind::Ingress, ghost, ctx.now()));
            ctx.store().save_ledger(&guard, &ledger).unwrap();
        }

        let report = h.sweeper.run().await;
        assert_eq!(report.released_ports, vec![30_500]);
        assert!(ctx.store().load_ledger().unwrap().reservations.is_empty());
    }

    #[tokio::test]
    async fn stale_provisioning_is_resolved() {
        let h = harness();
        let record = h.controller.create(CreateRequest::new("dev")).await.unwrap();
        // Rewind to provisioning, as if the invocation died after provisioning.
        {
            let store = h.controller.context().store();
            let guard = store.lock(LockKey::Deployment(record.id.clone())).unwrap();
            let mut stale = record.clone();
            stale.state = DeploymentState::Provisioning;
            stale.cluster = None;
            store.put_deployment(&guard, &stale).unwrap();
        }
        h.clock.advance(ChronoDuration::minutes(31));

        let report = h.sweeper.run().await;
        assert_eq!(report.resolved, vec![record.id.clone()]);
        let resolved = h.controller.get(&record.id).await.unwrap();
        assert_eq!(resolved.state, DeploymentState::Running);
        assert!(resolved.cluster.is_some());
    }

    /// Rewrite `record` as `destroying`, as if its tear-down was interrupted.
    fn interrupt_destroy(h: &Harness, record: &Deployment) {
        let store = h.controller.context().store();
        let guard = store.lock(LockKey::Deployment(record.id.clone())).unwrap();
        let mut interrupted = record.clone();
        interrupted.state = DeploymentState::Destroying;
        store.put_deployment(&guard, &interrupted).unwrap();
    }

    #[tokio::test]
    async fn interrupted_destroy_is_finished() {
        let h = harness();
        let record = h.controller.create(CreateRequest::new("dev")).await.unwrap();
        interrupt_destroy(&h, &record);

        let report = h.sweeper.run().await;
        assert_eq!(report.resolved, vec![record.id.clone()]);
        let swept = h.controller.get(&record.id).await.unwrap();
        assert_eq!(swept.state, DeploymentState::Destroyed);
        assert_eq!(h.provisioner.torn_down(), vec![record.id.to_string()]);
        let store = h.controller.context().store();
        assert!(store.load_ledger().unwrap().reservations.is_empty());

        // The name is free again.
        let again = h.controller.create(CreateRequest::new("dev")).await.unwrap();
        assert_eq!(again.state, DeploymentState::Running);
    }

    #[tokio::test]
    async fn interrupted_destroy_of_vanished_cluster_is_marked_destroyed() {
        let h = harness();
        let record = h.controller.create(CreateRequest::new("dev")).await.unwrap();
        interrupt_destroy(&h, &record);
        h.provisioner.remove_externally(record.id.as_str());

        let report = h.sweeper.run().await;
        assert_eq!(report.resolved, vec![record.id.clone()]);
        let swept = h.controller.get(&record.id).await.unwrap();
        assert_eq!(swept.state, DeploymentState::Destroyed);
        assert!(h.provisioner.torn_down().is_empty());
        let store = h.controller.context().store();
        assert!(store.load_ledger().unwrap().reservations.is_empty());
    }

    #[tokio::test]
    async fn destroy_in_progress_is_left_alone() {
        let h = harness();
        let record = h.controller.create(CreateRequest::new("dev")).await.unwrap();
        interrupt_destroy(&h, &record);

        let held = h
            .controller
            .context()
            .store()
            .lock(LockKey::Deployment(record.id.clone()))
            .unwrap();
        let report = h.sweeper.run().await;
        drop(held);

        assert!(report.resolved.is_empty());
        assert_eq!(report.skipped, vec![record.id.to_string()]);
        assert!(h.provisioner.torn_down().is_empty());
    }

    #[tokio::test]
    async fn busy_entity_is_skipped() {
        let h = harness();
        let record = h
            .controller
            .create(CreateRequest::new("dev").with_ttl("1h"))
            .await
            .unwrap();
        h.clock.advance(ChronoDuration::hours(2));

        let held = h
            .controller
            .context()
            .store()
            .lock(LockKey::Deployment(record.id.clone()))
            .unwrap();
        let started = std::time::Instant::now();
        let report = h.sweeper.run().await;
        let waited = started.elapsed();
        drop(held);

        // The store's own bound is 2s; the sweep does not wait it out.
        assert!(waited < Duration::from_secs(2), "sweep waited {waited:?}");
        assert!(report.expired.is_empty());
        assert_eq!(report.skipped, vec![record.id.to_string()]);

        let report = h.sweeper.run().await;
        assert_eq!(report.expired, vec![record.id]);
    }
}
