//! End-to-end scenarios across the controller, supervisor and sweeper.
//!
//! Each invocation in these tests gets its own `FileStore` over a shared
//! state directory, the way separate `devbox` processes would.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use devbox_control::{
    Connectivity, Context, ControlError, CreateRequest, DeploymentState, ErrorKind, Invocation,
    Lifecycle, LifecycleController, ListFilter, ManualClock, ProfileStatus, SourceDefinition,
    SourceId, Sweeper, TunnelSupervisor,
};
use devbox_core::{ProcessHandle, Provider};
use devbox_provision::{MockProvisioner, Sizing};
use devbox_store::{DevboxConfig, FileStore, Holder, PortRanges, Store, UserProfile};
use devbox_tunnel::{MockCredentialResolver, MockTunnelLauncher};
use tempfile::TempDir;

type Controller = LifecycleController<FileStore, MockProvisioner>;
type Supervisor = TunnelSupervisor<FileStore, MockTunnelLauncher, MockCredentialResolver>;

// =============================================================================
// Harness
// =============================================================================

struct World {
    dir: TempDir,
    clock: Arc<ManualClock>,
    provisioner: Arc<MockProvisioner>,
    launcher: Arc<MockTunnelLauncher>,
}

impl World {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            clock: Arc::new(ManualClock::new(start())),
            provisioner: Arc::new(MockProvisioner::new()),
            launcher: Arc::new(MockTunnelLauncher::new()),
        }
    }

    /// A fresh invocation over the shared state directory.
    fn invocation(&self, email: &str) -> Context<FileStore> {
        let store = Arc::new(FileStore::open(self.dir.path(), Duration::from_secs(5)).unwrap());
        let config = DevboxConfig {
            user_profile: UserProfile {
                email: Some(email.to_string()),
                ..UserProfile::default()
            },
            ports: PortRanges {
                probe_host: false,
                ..PortRanges::default()
            },
            sources: BTreeMap::from([("replica-postgres".to_string(), replica_source())]),
            ..DevboxConfig::default()
        };
        Context::new(store, config, self.clock.clone(), Invocation::new(email))
    }

    fn controller(&self) -> Controller {
        LifecycleController::new(self.invocation("jane.doe@example.com"), self.provisioner.clone())
    }

    fn supervisor(&self) -> Supervisor {
        TunnelSupervisor::new(
            self.invocation("jane.doe@example.com"),
            self.launcher.clone(),
            Arc::new(MockCredentialResolver::default()),
        )
    }

    fn sweeper(&self) -> Sweeper<FileStore, MockProvisioner, MockTunnelLauncher, MockCredentialResolver> {
        Sweeper::new(self.controller(), self.supervisor())
    }

    fn store(&self) -> FileStore {
        FileStore::open(self.dir.path(), Duration::from_secs(5)).unwrap()
    }

    /// Every reserved port with its holder.
    fn reservations(&self) -> Vec<(u16, Holder)> {
        self.store()
            .load_ledger()
            .unwrap()
            .reservations
            .into_iter()
            .map(|(port, r)| (port, r.holder))
            .collect()
    }
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap()
}

fn source(id: &str) -> SourceId {
    SourceId::parse(id).unwrap()
}

/// A source whose preferred local port is the same as `aws-postgres`.
fn replica_source() -> SourceDefinition {
    SourceDefinition {
        source_id: source("replica-postgres"),
        provider: Provider::Aws,
        description: "Read replica of the shared PostgreSQL instance".to_string(),
        bastion_host: "bastion-aws.platform.internal".to_string(),
        target_host: "postgres-replica.platform.internal".to_string(),
        remote_port: 5432,
        local_port: 5432,
        credentials_ref: "ssh-key:~/.ssh/platform_bastion_key".to_string(),
    }
}

/// Every port held by a live record appears once, and the ledger holds
/// exactly those ports for exactly those holders.
async fn assert_ledger_consistent(world: &World) {
    let mut held: Vec<(u16, Holder)> = Vec::new();
    let records = world
        .controller()
        .list(&ListFilter {
            include_destroyed: true,
            ..ListFilter::default()
        })
        .await
        .unwrap();
    for record in records.iter().filter(|d| d.state.holds_ports()) {
        for (_, port) in record.ports() {
            held.push((port, Holder::Deployment(record.id.clone())));
        }
    }
    for profile in world.store().list_profiles().unwrap() {
        if profile.status == ProfileStatus::Enabled {
            held.push((profile.local_port, Holder::Connection(profile.source_id.clone())));
        }
    }

    let distinct: BTreeSet<u16> = held.iter().map(|(port, _)| *port).collect();
    assert_eq!(distinct.len(), held.len(), "a port is held twice: {held:?}");

    held.sort();
    let mut reserved = world.reservations();
    reserved.sort();
    assert_eq!(reserved, held);
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_of_one_name_admit_exactly_one() {
    let world = Arc::new(World::new());

    let attempts = (0..4).map(|_| {
        let world = Arc::clone(&world);
        tokio::spawn(async move { world.controller().create(CreateRequest::new("dev")).await })
    });
    let results: Vec<Result<_, ControlError>> = futures::future::join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let created: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(created.len(), 1);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert!(
            matches!(err.kind, ErrorKind::NameConflict { .. }),
            "unexpected error: {err}"
        );
    }

    let listed = world
        .controller()
        .list(&ListFilter::default())
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(world.provisioner.cluster_count(), 1);
}

#[tokio::test]
async fn stop_then_start_keeps_identity() {
    let world = World::new();
    let created = world
        .controller()
        .create(CreateRequest::new("dev"))
        .await
        .unwrap();

    let stopped = world.controller().stop(&created.id).await.unwrap();
    assert_eq!(stopped.state, DeploymentState::Stopped);
    let started = world.controller().start(&created.id).await.unwrap();
    assert_eq!(started.state, DeploymentState::Running);

    assert_eq!(started.id, created.id);
    assert_eq!(started.ingress_port, created.ingress_port);
    assert_eq!(started.postgres_port, created.postgres_port);
    assert_eq!(started.kubeconfig_context, created.kubeconfig_context);
    assert_eq!(started.expires_at, created.expires_at);
}

#[tokio::test]
async fn destroy_twice_changes_nothing_the_second_time() {
    let world = World::new();
    let created = world
        .controller()
        .create(CreateRequest::new("dev"))
        .await
        .unwrap();

    let first = world.controller().destroy(&created.id, true).await.unwrap();
    let second = world.controller().destroy(&created.id, true).await.unwrap();

    assert_eq!(first.state, DeploymentState::Destroyed);
    assert_eq!(second.state, DeploymentState::Destroyed);
    assert_eq!(second.updated_at, first.updated_at);
    assert_eq!(second.destroyed_at, first.destroyed_at);
    assert_eq!(world.provisioner.torn_down(), vec![created.id.to_string()]);
}

#[tokio::test]
async fn expiry_is_applied_by_the_next_invocation() {
    let world = World::new();
    let created = world
        .controller()
        .create(CreateRequest::new("dev").with_ttl("1h"))
        .await
        .unwrap();
    world.clock.advance(chrono::Duration::minutes(61));

    // The next command sweeps before it lists.
    let report = world.sweeper().run().await;
    assert_eq!(report.expired, vec![created.id.clone()]);

    let listed = world
        .controller()
        .list(&ListFilter::state(DeploymentState::Expired))
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, created.id);
    assert!(world.reservations().is_empty());

    // The name is free again.
    let again = world
        .controller()
        .create(CreateRequest::new("dev"))
        .await
        .unwrap();
    assert_eq!(again.state, DeploymentState::Running);
    assert_ne!(again.id, created.id);
}

// =============================================================================
// Ports
// =============================================================================

#[tokio::test]
async fn ledger_matches_live_holders_through_mixed_operations() {
    let world = World::new();
    let a = world
        .controller()
        .create(CreateRequest::new("alpha"))
        .await
        .unwrap();
    let b = world
        .controller()
        .create(CreateRequest::new("beta"))
        .await
        .unwrap();
    let pg = world.supervisor().enable(&source("aws-postgres")).await.unwrap();
    let my = world.supervisor().enable(&source("aws-mysql")).await.unwrap();

    let mut expected: BTreeSet<u16> = [a.ports(), b.ports()]
        .concat()
        .into_iter()
        .map(|(_, port)| port)
        .collect();
    expected.insert(pg.local_port);
    expected.insert(my.local_port);
    let reserved: BTreeSet<u16> = world.reservations().into_iter().map(|(p, _)| p).collect();
    assert_eq!(reserved, expected);
    assert_eq!(reserved.len(), a.ports().len() + b.ports().len() + 2);

    world.controller().destroy(&a.id, true).await.unwrap();
    world.supervisor().disable(&source("aws-mysql")).await.unwrap();

    let holders: BTreeSet<Holder> = world.reservations().into_iter().map(|(_, h)| h).collect();
    assert_eq!(
        holders,
        BTreeSet::from([
            Holder::Deployment(b.id.clone()),
            Holder::Connection(source("aws-postgres")),
        ])
    );
    assert!(world.sweeper().run().await.released_ports.is_empty());
}

// =============================================================================
// Connectivity
// =============================================================================

#[tokio::test]
async fn enable_twice_then_observe_dead_tunnel() {
    let world = World::new();
    let aws = source("aws-postgres");
    let profile = world.supervisor().enable(&aws).await.unwrap();

    let err = world.supervisor().enable(&aws).await.unwrap_err();
    assert_eq!(
        err.kind,
        ErrorKind::AlreadyEnabled {
            local_port: profile.local_port
        }
    );
    assert_eq!(err.exit_code(), 1);

    world
        .launcher
        .kill(ProcessHandle::from_raw(profile.tunnel_pid.unwrap()));
    let info = world.supervisor().info(&aws).await.unwrap();
    assert_eq!(info.status, ProfileStatus::Degraded);
    assert!(info
        .profile
        .and_then(|p| p.last_error)
        .is_some_and(|e| e.contains("exited")));
    assert!(world.reservations().is_empty());
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_destroys_tear_down_once() {
    let world = Arc::new(World::new());
    let created = world
        .controller()
        .create(CreateRequest::new("dev"))
        .await
        .unwrap();
    world
        .provisioner
        .delay("tear_down", Duration::from_millis(300));

    let destroy = |world: &Arc<World>| {
        let world = Arc::clone(world);
        let id = created.id.clone();
        tokio::spawn(async move { world.controller().destroy(&id, true).await })
    };
    let first = destroy(&world);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = destroy(&world);

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(first.state, DeploymentState::Destroyed);
    assert_eq!(second.state, DeploymentState::Destroyed);
    assert_eq!(second.destroyed_at, first.destroyed_at);
    assert_eq!(world.provisioner.torn_down(), vec![created.id.to_string()]);
    assert_ledger_consistent(&world).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_stops_scale_once() {
    let world = Arc::new(World::new());
    let created = world
        .controller()
        .create(CreateRequest::new("dev"))
        .await
        .unwrap();
    world.provisioner.delay("scale", Duration::from_millis(300));

    let stop = |world: &Arc<World>| {
        let world = Arc::clone(world);
        let id = created.id.clone();
        tokio::spawn(async move { world.controller().stop(&id).await })
    };
    let first = stop(&world);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = stop(&world);

    assert_eq!(first.await.unwrap().unwrap().state, DeploymentState::Stopped);
    assert_eq!(second.await.unwrap().unwrap().state, DeploymentState::Stopped);
    assert_eq!(
        world.provisioner.sizing_history(created.id.as_str()),
        vec![Sizing::Active(created.node_spec.clone()), Sizing::Suspended]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_enables_with_one_preferred_port_get_distinct_ports() {
    let world = Arc::new(World::new());

    let enables = ["aws-postgres", "replica-postgres"].map(|id| {
        let world = Arc::clone(&world);
        tokio::spawn(async move { world.supervisor().enable(&source(id)).await })
    });
    let profiles: Vec<_> = futures::future::join_all(enables)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert_ne!(profiles[0].local_port, profiles[1].local_port);
    assert!(profiles.iter().any(|p| p.local_port == 5432));
    assert_ledger_consistent(&world).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_enable_create_and_destroy_keep_the_ledger_consistent() {
    let world = Arc::new(World::new());
    let doomed = world
        .controller()
        .create(CreateRequest::new("doomed"))
        .await
        .unwrap();

    let create = {
        let world = Arc::clone(&world);
        tokio::spawn(async move { world.controller().create(CreateRequest::new("dev")).await })
    };
    let enable = {
        let world = Arc::clone(&world);
        tokio::spawn(async move { world.supervisor().enable(&source("aws-postgres")).await })
    };
    let destroy = {
        let world = Arc::clone(&world);
        let id = doomed.id.clone();
        tokio::spawn(async move { world.controller().destroy(&id, true).await })
    };

    let created = create.await.unwrap().unwrap();
    let profile = enable.await.unwrap().unwrap();
    let destroyed = destroy.await.unwrap().unwrap();

    assert_eq!(created.state, DeploymentState::Running);
    assert_eq!(profile.status, ProfileStatus::Enabled);
    assert_eq!(destroyed.state, DeploymentState::Destroyed);
    assert_ledger_consistent(&world).await;
}
