//! Wiring and command handlers.
//!
//! An [`App`] is built once per invocation from the state root. Every handler
//! that touches deployments or tunnels runs a sweep first, so expiry and drift
//! are applied before the command sees any state.

use std::io::{self, BufRead, IsTerminal, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use devbox_control::error::During;
use devbox_control::{
    parse_duration, retry_busy, Connectivity, Context, ControlError, CreateRequest, Deployment,
    DeploymentId, ErrorKind, Lifecycle, LifecycleController, ListFilter,
    Operation, SourceId, SweepReport, Sweeper, TunnelSupervisor, BUSY_RETRY_BACKOFF,
};
use devbox_provision::{KindProvisioner, ProvisionerConfig};
use devbox_store::{DevboxConfig, FileStore, LockKey, Preset, Store};
use devbox_tunnel::{LocalCredentialResolver, SshTunnelLauncher, TunnelConfig};
use serde::Serialize;

use crate::settings;
use crate::ui;

/// Lock bound used only to read the configuration, which sets the real one.
const BOOTSTRAP_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

type Controller = LifecycleController<FileStore, KindProvisioner>;
type Supervisor = TunnelSupervisor<FileStore, SshTunnelLauncher, LocalCredentialResolver>;

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Human-readable tables.
    Text,
    /// Pretty JSON on stdout.
    Json,
}

/// Everything one invocation needs.
pub struct App {
    controller: Controller,
    supervisor: Supervisor,
    format: Format,
}

impl App {
    /// Open the state root and wire the controller, supervisor and sweeper
    /// to the real collaborators.
    pub fn open(home: &Path, format: Format) -> anyhow::Result<Self> {
        let store = FileStore::open(home, BOOTSTRAP_LOCK_TIMEOUT)
            .with_context(|| format!("failed to open state directory {}", home.display()))?;
        let config = store
            .load_config()
            .during(Operation::Configure, "config")?;
        let store = Arc::new(store.with_lock_timeout(config.lock_timeout()));
        tracing::debug!(root = %home.display(), "Loaded configuration");

        let ctx = Context::with_defaults(store, config);
        let controller = LifecycleController::new(
            ctx.clone(),
            Arc::new(KindProvisioner::new(ProvisionerConfig::from_env())),
        );
        let supervisor = TunnelSupervisor::new(
            ctx,
            Arc::new(SshTunnelLauncher::new(TunnelConfig::default())),
            Arc::new(LocalCredentialResolver::from_env()),
        );
        Ok(Self {
            controller,
            supervisor,
            format,
        })
    }

    fn ctx(&self) -> &Context<FileStore> {
        self.controller.context()
    }

    fn print<T: Serialize>(&self, value: &T, text: impl FnOnce() -> String) -> anyhow::Result<()> {
        match self.format {
            Format::Json => println!("{}", serde_json::to_string_pretty(value)?),
            Format::Text => print!("{}", text()),
        }
        Ok(())
    }

    /// Run one reconciliation pass.
    pub async fn sweep(&self) -> SweepReport {
        Sweeper::new(self.controller.clone(), self.supervisor.clone())
            .run()
            .await
    }

    // =========================================================================
    // Deployments
    // =========================================================================

    /// `devbox create`
    pub async fn create(
        &self,
        name: String,
        preset: Option<Preset>,
        ttl: Option<String>,
        owner: Option<String>,
    ) -> anyhow::Result<()> {
        self.sweep().await;
        let mut request = CreateRequest::new(name);
        request.preset = preset;
        request.ttl = ttl;
        request.owner = owner;

        let controller = &self.controller;
        let record = retry_busy(BUSY_RETRY_BACKOFF, move || controller.create(request.clone())).await?;
        self.print(&record, || {
            let mut out = ui::deployment(&record, self.ctx().now());
            out.push_str(&format!(
                "\nUse it with: kubectl --context {}\n",
                record.kubeconfig_context
            ));
            out
        })
    }

    /// `devbox start`
    pub async fn start(&self, id: &str) -> anyhow::Result<()> {
        self.sweep().await;
        let id = parse_id(Operation::Start, id)?;
        let controller = &self.controller;
        let id_ref = &id;
        let record = retry_busy(BUSY_RETRY_BACKOFF, move || controller.start(id_ref)).await?;
        self.print(&record, || ui::deployment(&record, self.ctx().now()))
    }

    /// `devbox stop`
    pub async fn stop(&self, id: &str) -> anyhow::Result<()> {
        self.sweep().await;
        let id = parse_id(Operation::Stop, id)?;
        let controller = &self.controller;
        let id_ref = &id;
        let record = retry_busy(BUSY_RETRY_BACKOFF, move || controller.stop(id_ref)).await?;
        self.print(&record, || ui::deployment(&record, self.ctx().now()))
    }

    /// `devbox extend`
    pub async fn extend(&self, id: &str, by: &str) -> anyhow::Result<()> {
        self.sweep().await;
        let id = parse_id(Operation::Extend, id)?;
        let by = parse_duration(by).map_err(|kind| ControlError::new(Operation::Extend, &id, kind))?;
        let controller = &self.controller;
        let id_ref = &id;
        let record = retry_busy(BUSY_RETRY_BACKOFF, move || controller.extend(id_ref, by)).await?;
        self.print(&record, || ui::deployment(&record, self.ctx().now()))
    }

    /// `devbox destroy`. A running deployment needs `force`, or a yes at the
    /// prompt when stdin is a terminal.
    pub async fn destroy(&self, id: &str, force: bool) -> anyhow::Result<()> {
        self.sweep().await;
        let id = parse_id(Operation::Destroy, id)?;
        let controller = &self.controller;
        let id_ref = &id;
        let record = match retry_busy(BUSY_RETRY_BACKOFF, move || {
            controller.destroy(id_ref, force)
        })
        .await
        {
            Err(err) if err.kind == ErrorKind::ConfirmationRequired && confirm(&id)? => {
                retry_busy(BUSY_RETRY_BACKOFF, move || controller.destroy(id_ref, true)).await?
            }
            result => result?,
        };
        self.print(&record, || ui::deployment(&record, self.ctx().now()))
    }

    /// `devbox list`
    pub async fn list(&self, filter: &ListFilter) -> anyhow::Result<()> {
        self.sweep().await;
        let records: Vec<Deployment> = self.controller.list(filter).await?;
        self.print(&records, || ui::deployments(&records, self.ctx().now()))
    }

    // =========================================================================
    // Connectivity
    // =========================================================================

    /// `devbox connect enable`
    pub async fn enable(&self, source: &str) -> anyhow::Result<()> {
        self.sweep().await;
        let source_id = parse_source(Operation::Enable, source)?;
        let supervisor = &self.supervisor;
        let source_ref = &source_id;
        retry_busy(BUSY_RETRY_BACKOFF, move || supervisor.enable(source_ref)).await?;
        let info = self.supervisor.info(&source_id).await?;
        self.print(&info, || ui::profile(&info))
    }

    /// `devbox connect disable`
    pub async fn disable(&self, source: &str) -> anyhow::Result<()> {
        self.sweep().await;
        let source_id = parse_source(Operation::Disable, source)?;
        let supervisor = &self.supervisor;
        let source_ref = &source_id;
        retry_busy(BUSY_RETRY_BACKOFF, move || supervisor.disable(source_ref)).await?;
        let info = self.supervisor.info(&source_id).await?;
        self.print(&info, || format!("Disabled {source_id}.\n"))
    }

    /// `devbox connect info`
    pub async fn info(&self, source: &str) -> anyhow::Result<()> {
        self.sweep().await;
        let source_id = parse_source(Operation::Info, source)?;
        let info = self.supervisor.info(&source_id).await?;
        self.print(&info, || ui::profile(&info))
    }

    /// `devbox connect list`
    pub async fn connections(&self) -> anyhow::Result<()> {
        self.sweep().await;
        let infos = self.supervisor.list().await?;
        self.print(&infos, || ui::profiles(&infos))
    }

    /// `devbox connect sources`
    pub fn sources(&self) -> anyhow::Result<()> {
        let catalog = self.supervisor.catalog();
        let sources: Vec<_> = catalog.iter().collect();
        self.print(&sources, || ui::sources(catalog))
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// `devbox sweep`
    pub async fn sweep_command(&self) -> anyhow::Result<()> {
        let report = self.sweep().await;
        self.print(&report, || ui::sweep(&report))
    }

    /// `devbox config show`
    pub fn show_config(&self) -> anyhow::Result<()> {
        let config = self.ctx().config();
        println!("{}", serde_json::to_string_pretty(config)?);
        Ok(())
    }

    /// `devbox config set`
    pub async fn set_config(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let op = Operation::Configure;
        let guard = self.ctx().lock(LockKey::Config, op, key).await?;
        let store = self.ctx().store();
        let mut config: DevboxConfig = store.load_config().during(op, key)?;
        settings::apply(&mut config, key, value).map_err(|kind| ControlError::new(op, key, kind))?;
        store.save_config(&guard, &config).during(op, key)?;
        tracing::info!(key, "Updated configuration");
        println!("{key} = {value}");
        Ok(())
    }
}

fn parse_id(operation: Operation, id: &str) -> Result<DeploymentId, ControlError> {
    DeploymentId::parse(id.trim()).during(operation, id)
}

fn parse_source(operation: Operation, source: &str) -> Result<SourceId, ControlError> {
    SourceId::parse(source.trim()).during(operation, source)
}

/// Ask on stderr whether to destroy a running deployment. Without a terminal
/// the answer is no.
fn confirm(id: &DeploymentId) -> io::Result<bool> {
    let stdin = io::stdin();
    if !stdin.is_terminal() {
        return Ok(false);
    }
    let mut stderr = io::stderr();
    write!(stderr, "{id} is running. Destroy it? [y/N] ")?;
    stderr.flush()?;
    let mut answer = String::new();
    stdin.lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes" | "YES" | "Yes"))
}
