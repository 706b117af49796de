//! Lifecycle controller implementation.
//!
//! This module provides the `Lifecycle` trait and the `LifecycleController`
//! that drives deployments through their state machine, delegating cluster
//! work to a [`ClusterProvisioner`].
//!
//! A deployment's lock is held for the whole of an operation on it, provisioner
//! call included, so operations on one deployment run one at a time. A
//! contender waits up to the lock bound and fails with `Busy` before it has
//! acted. Errors raised after the provisioner acted are marked
//! [`ControlError::after_side_effects`] and are never retried.
//!
//! `create` checks the name under the name lock, writes the `provisioning`
//! record under the new id's lock, then drops the name lock and keeps the id
//! lock while it provisions. A concurrent `create` of the same name sees the
//! `provisioning` record and fails with `NameConflict`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use devbox_core::{validate_name, ClusterHandle, DeploymentId, Operation, PortKind};
use devbox_provision::{ClusterProvisioner, ClusterSpec, ProvisionError, Sizing};
use devbox_store::{
    Deployment, DeploymentFilter, DeploymentState, EntityLock, FailureDetail, Holder, LockKey,
    Outcome, Preset, Store,
};
use tracing::{info, warn};

use crate::context::Context;
use crate::duration::parse_duration;
use crate::error::{ControlError, During, ErrorKind, Result};
use crate::lifecycle;
use crate::types::{CreateRequest, ListFilter};

/// Trait defining the deployment lifecycle operations.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    // =========================================================================
    // Records
    // =========================================================================

    /// Create and provision a new deployment.
    ///
    /// # Errors
    ///
    /// Returns `NameConflict` if an active record already uses the name,
    /// `ResourceExhausted` if no ports are left, and `CollaboratorFailure`
    /// if provisioning fails (the record is then left in `failed`).
    async fn create(&self, request: CreateRequest) -> Result<Deployment>;

    /// Get a deployment by ID.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no record has this ID.
    async fn get(&self, id: &DeploymentId) -> Result<Deployment>;

    /// List deployments matching `filter`, oldest first.
    async fn list(&self, filter: &ListFilter) -> Result<Vec<Deployment>>;

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Scale a running deployment to zero. A stopped deployment is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` from any state other than `running`/`stopped`.
    async fn stop(&self, id: &DeploymentId) -> Result<Deployment>;

    /// Restore a stopped deployment to its recorded sizing.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` from any state other than `stopped`.
    async fn start(&self, id: &DeploymentId) -> Result<Deployment>;

    /// Push `expires_at` later by `by`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the deployment is `running` or `stopped`.
    async fn extend(&self, id: &DeploymentId, by: Duration) -> Result<Deployment>;

    /// Tear down a deployment and release its ports.
    ///
    /// Destroying a destroyed or expired record is a no-op success.
    ///
    /// # Errors
    ///
    /// Returns `ConfirmationRequired` for a running deployment unless `force`.
    async fn destroy(&self, id: &DeploymentId, force: bool) -> Result<Deployment>;
}

/// The lifecycle controller.
pub struct LifecycleController<S: Store, P: ClusterProvisioner> {
    ctx: Context<S>,
    provisioner: Arc<P>,
}

impl<S: Store, P: ClusterProvisioner> Clone for LifecycleController<S, P> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            provisioner: Arc::clone(&self.provisioner),
        }
    }
}

impl<S: Store + 'static, P: ClusterProvisioner + 'static> LifecycleController<S, P> {
    /// Create a new controller.
    #[must_use]
    pub fn new(ctx: Context<S>, provisioner: Arc<P>) -> Self {
        Self { ctx, provisioner }
    }

    /// Get the invocation context.
    #[must_use]
    pub const fn context(&self) -> &Context<S> {
        &self.ctx
    }

    /// Get the provisioner.
    #[must_use]
    pub fn provisioner(&self) -> &P {
        &self.provisioner
    }

    /// The same controller over `ctx`.
    #[must_use]
    pub fn with_context(&self, ctx: Context<S>) -> Self {
        Self {
            ctx,
            provisioner: Arc::clone(&self.provisioner),
        }
    }

    fn load(&self, operation: Operation, id: &DeploymentId) -> Result<Deployment> {
        self.ctx
            .store()
            .get_deployment(id)
            .during(operation, id)?
            .ok_or_else(|| ControlError::new(operation, id, ErrorKind::NotFound))
    }

    /// The handle recorded at provisioning time, or the one provisioning
    /// would have produced.
    pub(crate) fn cluster_handle(record: &Deployment) -> ClusterHandle {
        record.cluster.clone().unwrap_or_else(|| {
            ClusterHandle::new(record.id.as_str(), record.kubeconfig_context.as_str())
        })
    }

    fn require(
        operation: Operation,
        record: &Deployment,
        allowed: &[DeploymentState],
        to: &str,
    ) -> Result<()> {
        if allowed.contains(&record.state) {
            Ok(())
        } else {
            Err(ControlError::new(
                operation,
                &record.id,
                ErrorKind::InvalidState {
                    from: record.state.to_string(),
                    to: to.to_string(),
                },
            ))
        }
    }

    /// Lock `id` and load its record.
    pub(crate) async fn lock_record(
        &self,
        operation: Operation,
        id: &DeploymentId,
    ) -> Result<(EntityLock, Deployment)> {
        let guard = self
            .ctx
            .lock(LockKey::Deployment(id.clone()), operation, id)
            .await?;
        let record = self.load(operation, id)?;
        Ok((guard, record))
    }

    /// Reload `id` under `guard`, check the transition to `to`, apply
    /// `update`, and persist. With `release_ports`, the record's ledger
    /// reservations are released afterwards under the ledger lock.
    pub(crate) async fn transition<F>(
        &self,
        guard: &EntityLock,
        operation: Operation,
        id: &DeploymentId,
        to: DeploymentState,
        release_ports: bool,
        update: F,
    ) -> Result<Deployment>
    where
        F: FnOnce(&mut Deployment) + Send,
    {
        let mut record = self.load(operation, id)?;
        let from = record.state;
        lifecycle::validate_transition(operation, id, from, to)?;

        let now = self.ctx.now();
        record.state = to;
        record.updated_at = now;
        if to == DeploymentState::Destroyed {
            record.destroyed_at.get_or_insert(now);
        }
        update(&mut record);
        self.ctx
            .store()
            .put_deployment(guard, &record)
            .during(operation, id)?;
        tracing::debug!(deployment_id = %id, %from, %to, "Transitioned deployment");

        if release_ports {
            self.release_ports(operation, &record).await?;
        }
        Ok(record)
    }

    async fn release_ports(&self, operation: Operation, record: &Deployment) -> Result<Vec<u16>> {
        let guard = self
            .ctx
            .lock(LockKey::Ledger, operation, &record.id)
            .await?;
        let store = self.ctx.store();
        let mut ledger = store.load_ledger().during(operation, &record.id)?;
        let released = ledger.release_holder(&record.holder());
        if !released.is_empty() {
            store
                .save_ledger(&guard, &ledger)
                .during(operation, &record.id)?;
            info!(deployment_id = %record.id, ports = ?released, "Released ports");
        }
        Ok(released)
    }

    /// Move a record to `failed`, releasing its ports.
    pub(crate) async fn fail(
        &self,
        guard: &EntityLock,
        operation: Operation,
        id: &DeploymentId,
        reason: &str,
        message: &str,
    ) -> Result<Deployment> {
        let failure = FailureDetail {
            reason: reason.to_string(),
            message: message.to_string(),
            at: self.ctx.now(),
        };
        let record = self
            .transition(guard, operation, id, DeploymentState::Failed, true, move |r| {
                r.failure = Some(failure);
            })
            .await?;
        warn!(deployment_id = %id, reason, "Deployment failed");
        Ok(record)
    }

    /// Tear down a deployment's cluster and land it in `final_state`
    /// (`destroyed` or `expired`).
    ///
    /// A tear-down error lands the record in `failed`, except for a record
    /// that was already `failed`, which is destroyed anyway. A record found in
    /// `destroying` was left by an interrupted tear-down, which is re-driven.
    pub(crate) async fn tear_down(
        &self,
        guard: &EntityLock,
        operation: Operation,
        record: Deployment,
        final_state: DeploymentState,
    ) -> Result<Deployment> {
        let id = record.id.clone();
        let was_failed = record.state == DeploymentState::Failed;
        if record.state != DeploymentState::Destroying {
            self.transition(guard, operation, &id, DeploymentState::Destroying, false, |_| {})
                .await?;
        }

        let handle = Self::cluster_handle(&record);
        if let Err(err) = self.provisioner.tear_down(&handle).await {
            if was_failed {
                warn!(deployment_id = %id, error = %err, "Tear-down of failed deployment failed, marking destroyed");
            } else {
                let message = collaborator_text(&err);
                self.fail(guard, operation, &id, "CollaboratorFailure", &message)
                    .await
                    .map_err(ControlError::after_side_effects)?;
                self.ctx
                    .record(operation, &id, Outcome::Failed, Some(message));
                return Err(ControlError::new(operation, &id, err.into()).after_side_effects());
            }
        }

        let record = self
            .transition(guard, operation, &id, final_state, true, |_| {})
            .await
            .map_err(ControlError::after_side_effects)?;
        info!(deployment_id = %id, state = %final_state, "Deployment torn down");
        self.ctx.record(operation, &id, Outcome::Ok, None);
        Ok(record)
    }

    async fn scale(
        &self,
        guard: &EntityLock,
        operation: Operation,
        record: &Deployment,
        sizing: &Sizing,
    ) -> Result<()> {
        let handle = Self::cluster_handle(record);
        match self.provisioner.scale(&handle, sizing).await {
            Ok(()) => Ok(()),
            Err(ProvisionError::ClusterNotFound(name)) => {
                let message = format!("cluster {name} no longer exists");
                self.fail(guard, operation, &record.id, "ExternalResourceMissing", &message)
                    .await
                    .map_err(ControlError::after_side_effects)?;
                self.ctx
                    .record(operation, &record.id, Outcome::Failed, Some(message.clone()));
                Err(ControlError::new(
                    operation,
                    &record.id,
                    ErrorKind::ExternalResourceMissing(message),
                ))
            }
            Err(err) => {
                self.ctx.record(
                    operation,
                    &record.id,
                    Outcome::Failed,
                    Some(collaborator_text(&err)),
                );
                Err(ControlError::new(operation, &record.id, err.into()))
            }
        }
    }

    /// Check the name, pick a unique id, reserve ports, and write the
    /// `provisioning` record, all under the name, id, and ledger locks. The
    /// id lock is handed back to the caller.
    async fn reserve(
        &self,
        name: &str,
        owner: &str,
        preset: Preset,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<(Deployment, EntityLock)> {
        let op = Operation::Create;
        let store = self.ctx.store();
        let _name_guard = self.ctx.lock(LockKey::name(name), op, name).await?;

        let same_name = store
            .list_deployments(&DeploymentFilter {
                name: Some(name.to_string()),
                ..DeploymentFilter::default()
            })
            .during(op, name)?;
        if let Some(holder) = same_name.iter().find(|d| d.state.holds_name()) {
            return Err(ControlError::new(
                op,
                name,
                ErrorKind::NameConflict {
                    holder: holder.id.to_string(),
                },
            ));
        }

        let base = DeploymentId::derive(name, owner, now.date_naive()).during(op, name)?;
        let (id, guard) = self.claim_id(name, base).await?;

        let ledger_guard = self.ctx.lock(LockKey::Ledger, op, &id).await?;
        let mut ledger = store.load_ledger().during(op, &id)?;
        let holder = Holder::Deployment(id.clone());
        let allocator = self.ctx.allocator();
        let ingress_port = allocator
            .reserve(&mut ledger, PortKind::Ingress, None, &holder, now)
            .map_err(|kind| ControlError::new(op, &id, kind))?;
        let postgres_port = if preset.has_database() {
            Some(
                allocator
                    .reserve(&mut ledger, PortKind::Ingress, None, &holder, now)
                    .map_err(|kind| ControlError::new(op, &id, kind))?,
            )
        } else {
            None
        };

        let record = Deployment {
            id: id.clone(),
            name: name.to_string(),
            owner: owner.to_string(),
            preset,
            state: DeploymentState::Provisioning,
            node_spec: preset.node_spec(),
            created_at: now,
            updated_at: now,
            expires_at: Some(expires_at),
            kubeconfig_context: format!("kind-{id}"),
            cluster: None,
            ingress_port: Some(ingress_port),
            postgres_port,
            tags: self.tags(owner, expires_at),
            failure: None,
            destroyed_at: None,
        };

        // Ledger before record: the sweeper releases reservations whose
        // holder has no record.
        store.save_ledger(&ledger_guard, &ledger).during(op, &id)?;
        store.put_deployment(&guard, &record).during(op, &id)?;
        info!(
            deployment_id = %id,
            ingress_port,
            postgres_port = ?postgres_port,
            "Reserved deployment"
        );
        Ok((record, guard))
    }

    /// Lock the first free id among `base`, `base-2`, `base-3`, ...
    async fn claim_id(
        &self,
        name: &str,
        base: DeploymentId,
    ) -> Result<(DeploymentId, EntityLock)> {
        let op = Operation::Create;
        let store = self.ctx.store();
        for n in 1..=u32::MAX {
            let candidate = if n == 1 {
                base.clone()
            } else {
                base.with_suffix(n)
            };
            if store.deployment_exists(&candidate).during(op, name)? {
                continue;
            }
            let guard = self
                .ctx
                .lock(LockKey::Deployment(candidate.clone()), op, &candidate)
                .await?;
            if !store.deployment_exists(&candidate).during(op, name)? {
                return Ok((candidate, guard));
            }
        }
        Err(ControlError::new(
            op,
            name,
            ErrorKind::Storage(format!("no free deployment id derived from {base}")),
        ))
    }

    fn tags(&self, owner: &str, expires_at: DateTime<Utc>) -> BTreeMap<String, String> {
        let config = self.ctx.config();
        let mut tags = config.default_tags.clone();
        tags.insert("Region".to_string(), config.default_region.clone());
        if let Some(org) = &config.user_profile.org {
            tags.insert("Org".to_string(), org.clone());
        }
        if let Some(team) = &config.user_profile.team {
            tags.insert("Team".to_string(), team.clone());
        }
        tags.insert("Owner".to_string(), owner.to_string());
        tags.insert("AutoDestroy".to_string(), expires_at.to_rfc3339());
        tags.insert("ManagedBy".to_string(), "devbox".to_string());
        tags
    }
}

#[async_trait]
impl<S: Store + 'static, P: ClusterProvisioner + 'static> Lifecycle for LifecycleController<S, P> {
    async fn create(&self, request: CreateRequest) -> Result<Deployment> {
        let op = Operation::Create;
        let name = request.name.trim().to_string();
        validate_name(&name).during(op, &name)?;

        let config = self.ctx.config();
        let owner = request
            .owner
            .filter(|owner| !owner.trim().is_empty())
            .or_else(|| config.owner_email().map(str::to_string))
            .ok_or_else(|| {
                ControlError::new(
                    op,
                    &name,
                    ErrorKind::InvalidArgument(
                        "no owner email configured (devbox config set user.email <email>)"
                            .to_string(),
                    ),
                )
            })?;
        let preset = request.preset.unwrap_or(config.default_preset);
        let ttl = parse_duration(request.ttl.as_deref().unwrap_or(config.default_expiration.as_str()))
            .map_err(|kind| ControlError::new(op, &name, kind))?;

        let now = self.ctx.now();
        let expires_at = now.checked_add_signed(ttl).ok_or_else(|| {
            ControlError::new(
                op,
                &name,
                ErrorKind::InvalidArgument("expiry is out of range".to_string()),
            )
        })?;

        let (record, guard) = self.reserve(&name, &owner, preset, now, expires_at).await?;
        let id = record.id.clone();
        info!(deployment_id = %id, %preset, "Provisioning deployment");

        let spec = ClusterSpec {
            cluster_name: id.to_string(),
            node_spec: record.node_spec.clone(),
            ingress_port: record.ingress_port,
            postgres_port: record.postgres_port,
        };
        match self.provisioner.provision(&spec).await {
            Ok(handle) => {
                let record = self
                    .transition(&guard, op, &id, DeploymentState::Running, false, move |r| {
                        r.kubeconfig_context.clone_from(&handle.context);
                        r.cluster = Some(handle);
                    })
                    .await
                    .map_err(ControlError::after_side_effects)?;
                info!(
                    deployment_id = %id,
                    context = %record.kubeconfig_context,
                    "Deployment running"
                );
                self.ctx
                    .record(op, &id, Outcome::Ok, Some(preset.to_string()));
                Ok(record)
            }
            Err(err) => {
                let message = collaborator_text(&err);
                warn!(deployment_id = %id, error = %message, "Provisioning failed");

                let partial = ClusterHandle::new(&spec.cluster_name, spec.context());
                if let Err(cleanup) = self.provisioner.tear_down(&partial).await {
                    warn!(
                        deployment_id = %id,
                        error = %cleanup,
                        "Cleanup after failed provisioning failed"
                    );
                }

                self.fail(&guard, op, &id, "CollaboratorFailure", &message)
                    .await
                    .map_err(ControlError::after_side_effects)?;
                self.ctx.record(op, &id, Outcome::Failed, Some(message));
                Err(ControlError::new(op, &id, err.into()).after_side_effects())
            }
        }
    }

    async fn get(&self, id: &DeploymentId) -> Result<Deployment> {
        self.load(Operation::List, id)
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<Deployment>> {
        let mut records = self
            .ctx
            .store()
            .list_deployments(&filter.store_filter())
            .during(Operation::List, "deployments")?;
        if filter.expiring_soon {
            let horizon = self
                .ctx
                .now()
                .checked_add_signed(self.ctx.config().expiring_soon())
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            records.retain(|d| {
                !d.state.is_terminal() && d.expires_at.is_some_and(|at| at <= horizon)
            });
        }
        Ok(records)
    }

    async fn stop(&self, id: &DeploymentId) -> Result<Deployment> {
        let op = Operation::Stop;
        let (guard, record) = self.lock_record(op, id).await?;
        if record.state == DeploymentState::Stopped {
            info!(deployment_id = %id, "Deployment already stopped");
            self.ctx
                .record(op, id, Outcome::Noop, Some("already stopped".to_string()));
            return Ok(record);
        }
        Self::require(op, &record, &[DeploymentState::Running], "stopped")?;

        self.scale(&guard, op, &record, &Sizing::Suspended).await?;
        let record = self
            .transition(&guard, op, id, DeploymentState::Stopped, false, |_| {})
            .await
            .map_err(ControlError::after_side_effects)?;
        info!(deployment_id = %id, "Deployment stopped");
        self.ctx.record(op, id, Outcome::Ok, None);
        Ok(record)
    }

    async fn start(&self, id: &DeploymentId) -> Result<Deployment> {
        let op = Operation::Start;
        let (guard, record) = self.lock_record(op, id).await?;
        Self::require(op, &record, &[DeploymentState::Stopped], "running")?;

        self.scale(&guard, op, &record, &Sizing::Active(record.node_spec.clone()))
            .await?;
        let record = self
            .transition(&guard, op, id, DeploymentState::Running, false, |_| {})
            .await
            .map_err(ControlError::after_side_effects)?;
        info!(deployment_id = %id, workers = record.node_spec.workers, "Deployment started");
        self.ctx.record(op, id, Outcome::Ok, None);
        Ok(record)
    }

    async fn extend(&self, id: &DeploymentId, by: Duration) -> Result<Deployment> {
        let op = Operation::Extend;
        if by <= Duration::zero() {
            return Err(ControlError::new(
                op,
                id,
                ErrorKind::InvalidArgument("extension must be positive".to_string()),
            ));
        }

        let (guard, mut record) = self.lock_record(op, id).await?;
        Self::require(
            op,
            &record,
            &[DeploymentState::Running, DeploymentState::Stopped],
            "extended",
        )?;

        let now = self.ctx.now();
        let expires_at = record
            .expires_at
            .unwrap_or(now)
            .checked_add_signed(by)
            .ok_or_else(|| {
                ControlError::new(
                    op,
                    id,
                    ErrorKind::InvalidArgument("expiry is out of range".to_string()),
                )
            })?;
        record.expires_at = Some(expires_at);
        record.updated_at = now;
        record
            .tags
            .insert("AutoDestroy".to_string(), expires_at.to_rfc3339());
        self.ctx
            .store()
            .put_deployment(&guard, &record)
            .during(op, id)?;

        info!(deployment_id = %id, %expires_at, "Extended deployment");
        self.ctx.record(
            op,
            id,
            Outcome::Ok,
            Some(format!("expires_at={}", expires_at.to_rfc3339())),
        );
        Ok(record)
    }

    async fn destroy(&self, id: &DeploymentId, force: bool) -> Result<Deployment> {
        let op = Operation::Destroy;
        let (guard, record) = self.lock_record(op, id).await?;
        match record.state {
            DeploymentState::Destroyed => {
                info!(deployment_id = %id, "Deployment already destroyed");
                self.ctx
                    .record(op, id, Outcome::Noop, Some("already destroyed".to_string()));
                Ok(record)
            }
            DeploymentState::Expired => {
                let record = self
                    .transition(&guard, op, id, DeploymentState::Destroyed, true, |_| {})
                    .await?;
                self.ctx
                    .record(op, id, Outcome::Noop, Some("already torn down".to_string()));
                Ok(record)
            }
            DeploymentState::Running if !force => Err(ControlError::new(
                op,
                id,
                ErrorKind::ConfirmationRequired,
            )),
            _ => {
                self.tear_down(&guard, op, record, DeploymentState::Destroyed)
                    .await
            }
        }
    }
}

/// The collaborator's own error text.
fn collaborator_text(err: &ProvisionError) -> String {
    err.tool_output()
        .map_or_else(|| err.to_string(), str::to_string)
}
