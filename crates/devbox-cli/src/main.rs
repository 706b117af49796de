//! devbox - manage local Kubernetes deployments and tunnels to shared data
//! sources.
//!
//! This is the entry point for the `devbox` binary. Exit codes:
//!
//! - `0` success
//! - `1` user-correctable error (bad arguments, name conflict, invalid state)
//! - `2` environment or collaborator failure (lock contention, `kind`/`ssh`
//!   errors, unreadable state)

mod app;
mod settings;
mod ui;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args as ClapArgs, Parser, Subcommand};
use devbox_control::{ControlError, DeploymentState, ListFilter};
use devbox_store::Preset;
use tracing_subscriber::EnvFilter;

use app::{App, Format};

/// devbox - local Kubernetes deployments and data-source tunnels.
#[derive(Parser, Debug)]
#[command(name = "devbox")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// State directory (defaults to ~/.platform).
    #[arg(long, env = "DEVBOX_HOME", global = true)]
    home: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long, global = true, default_value = "false")]
    debug: bool,

    /// Print JSON instead of tables.
    #[arg(long, global = true, default_value = "false")]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create and provision a new deployment.
    Create {
        /// Deployment name (letters, digits and hyphens).
        name: String,
        /// Sizing template: development, performance, customer-reproduction.
        #[arg(long)]
        preset: Option<Preset>,
        /// Time to live, e.g. 4h, 3d, 1w.
        #[arg(long)]
        ttl: Option<String>,
        /// Owner email, if not the configured one.
        #[arg(long)]
        owner: Option<String>,
    },
    /// Scale a stopped deployment back up.
    Start {
        /// Deployment ID.
        id: String,
    },
    /// Scale a running deployment to zero.
    Stop {
        /// Deployment ID.
        id: String,
    },
    /// Push back a deployment's expiry.
    Extend {
        /// Deployment ID.
        id: String,
        /// Extra time, e.g. 12h, 2d.
        duration: String,
    },
    /// Tear down a deployment.
    Destroy {
        /// Deployment ID.
        id: String,
        /// Destroy a running deployment without asking.
        #[arg(long, short)]
        force: bool,
    },
    /// List deployments.
    List(ListArgs),
    /// Reconcile recorded state with clusters and tunnels.
    Sweep,
    /// Manage tunnels to shared data sources.
    Connect {
        #[command(subcommand)]
        action: ConnectCommand,
    },
    /// Show or change configuration.
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
}

#[derive(ClapArgs, Debug, Default)]
#[allow(clippy::struct_excessive_bools)]
struct ListArgs {
    /// Only deployments owned by this email.
    #[arg(long)]
    owner: Option<String>,
    /// Only deployments in this state.
    #[arg(long)]
    status: Option<DeploymentState>,
    /// Only running deployments.
    #[arg(long, conflicts_with_all = ["status", "stopped"])]
    running: bool,
    /// Only stopped deployments.
    #[arg(long, conflicts_with = "status")]
    stopped: bool,
    /// Only deployments expiring within the configured window.
    #[arg(long)]
    expiring_soon: bool,
    /// Include destroyed deployments.
    #[arg(long)]
    all: bool,
}

impl ListArgs {
    fn filter(self) -> ListFilter {
        let state = self
            .status
            .or(self.running.then_some(DeploymentState::Running))
            .or(self.stopped.then_some(DeploymentState::Stopped));
        ListFilter {
            owner: self.owner,
            state,
            expiring_soon: self.expiring_soon,
            include_destroyed: self.all || state == Some(DeploymentState::Destroyed),
        }
    }
}

#[derive(Subcommand, Debug)]
enum ConnectCommand {
    /// Open a tunnel to a data source.
    Enable {
        /// Data source, e.g. aws-postgres.
        source: String,
    },
    /// Close a tunnel and forget its profile.
    Disable {
        /// Data source.
        source: String,
    },
    /// Show a data source's live status.
    Info {
        /// Data source.
        source: String,
    },
    /// List connections with live status.
    List,
    /// List available data sources.
    Sources,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print the configuration.
    Show,
    /// Set one value, e.g. `devbox config set user.email jane@example.com`.
    Set {
        /// Key such as user.email, default.preset, tags.<name>.
        key: String,
        /// New value; empty clears optional fields.
        value: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    init_tracing(args.debug);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}

/// Logs go to stderr so stdout stays scriptable. `RUST_LOG` wins.
fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "warn,devbox=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .with_target(debug)
        .init();
}

fn exit_code(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<ControlError>()
        .map_or(2, ControlError::exit_code)
}

fn home_dir(arg: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(home) = arg {
        return Ok(home);
    }
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".platform"))
        .ok_or_else(|| anyhow::anyhow!("HOME is not set; pass --home or set DEVBOX_HOME"))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let format = if args.json { Format::Json } else { Format::Text };
    let app = App::open(&home_dir(args.home)?, format)?;

    match args.command {
        Command::Create {
            name,
            preset,
            ttl,
            owner,
        } => app.create(name, preset, ttl, owner).await,
        Command::Start { id } => app.start(&id).await,
        Command::Stop { id } => app.stop(&id).await,
        Command::Extend { id, duration } => app.extend(&id, &duration).await,
        Command::Destroy { id, force } => app.destroy(&id, force).await,
        Command::List(list) => app.list(&list.filter()).await,
        Command::Sweep => app.sweep_command().await,
        Command::Connect { action } => match action {
            ConnectCommand::Enable { source } => app.enable(&source).await,
            ConnectCommand::Disable { source } => app.disable(&source).await,
            ConnectCommand::Info { source } => app.info(&source).await,
            ConnectCommand::List => app.connections().await,
            ConnectCommand::Sources => app.sources(),
        },
        Command::Config { action } => match action {
            ConfigCommand::Show => app.show_config(),
            ConfigCommand::Set { key, value } => app.set_config(&key, &value).await,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use devbox_control::{ErrorKind, Operation};

    #[test]
    fn cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn parses_create_flags() {
        let args = Args::try_parse_from([
            "devbox", "create", "dev", "--preset", "performance", "--ttl", "3d",
        ])
        .unwrap();
        match args.command {
            Command::Create { name, preset, ttl, .. } => {
                assert_eq!(name, "dev");
                assert_eq!(preset, Some(Preset::Performance));
                assert_eq!(ttl.as_deref(), Some("3d"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn list_flags_pick_state() {
        let running = ListArgs {
            running: true,
            ..ListArgs::default()
        };
        assert_eq!(running.filter().state, Some(DeploymentState::Running));

        let destroyed = ListArgs {
            status: Some(DeploymentState::Destroyed),
            ..ListArgs::default()
        };
        assert!(destroyed.filter().include_destroyed);

        let args = Args::try_parse_from(["devbox", "list", "--stopped", "--all"]).unwrap();
        let Command::List(list) = args.command else {
            panic!("expected list");
        };
        let filter = list.filter();
        assert_eq!(filter.state, Some(DeploymentState::Stopped));
        assert!(filter.include_destroyed);
    }

    #[test]
    fn rejects_unknown_preset() {
        assert!(Args::try_parse_from(["devbox", "create", "dev", "--preset", "huge"]).is_err());
    }

    #[test]
    fn control_errors_keep_their_exit_code() {
        let user = anyhow::Error::from(ControlError::new(
            Operation::Create,
            "dev",
            ErrorKind::NameConflict {
                holder: "jane-doe-dev-1019".into(),
            },
        ));
        assert_eq!(exit_code(&user), 1);

        let busy = anyhow::Error::from(ControlError::new(
            Operation::Stop,
            "jane-doe-dev-1019",
            ErrorKind::Busy("deployment:jane-doe-dev-1019".into()),
        ));
        assert_eq!(exit_code(&busy), 2);
        assert_eq!(exit_code(&anyhow::anyhow!("disk on fire")), 2);
    }
}
