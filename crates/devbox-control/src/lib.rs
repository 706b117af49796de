//! Deployment lifecycle and connectivity control for devbox.
//!
//! This crate holds the business logic behind every `devbox` verb. It
//! coordinates the file store with the cluster provisioner and the tunnel
//! launcher, and keeps the port ledger consistent across concurrent
//! invocations.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       devbox (CLI)                          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Context                            │
//! │  ┌─────────────┐ ┌─────────────┐ ┌─────────────────────┐    │
//! │  │ Lifecycle   │ │  Tunnel     │ │      Sweeper        │    │
//! │  │ Controller  │ │  Supervisor │ │  (reconciliation)   │    │
//! │  └─────────────┘ └─────────────┘ └─────────────────────┘    │
//! │          PortAllocator · Catalog · Clock · usage log         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!               ┌──────────────┼──────────────┐
//!               ▼              ▼              ▼
//!        ┌──────────┐   ┌────────────┐  ┌──────────┐
//!        │  Store   │   │ Provisioner│  │ Launcher │
//!        │ (files)  │   │   (kind)   │  │  (ssh)   │
//!        └──────────┘   └────────────┘  └──────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use devbox_control::{Context, CreateRequest, Lifecycle, LifecycleController};
//! use devbox_provision::{KindProvisioner, ProvisionerConfig};
//! use devbox_store::{DevboxConfig, FileStore, Store};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(FileStore::open("/tmp/devbox", std::time::Duration::from_secs(10))?);
//! let config = store.load_config()?;
//! let ctx = Context::with_defaults(store, config);
//!
//! let provisioner = Arc::new(KindProvisioner::new(ProvisionerConfig::default()));
//! let controller = LifecycleController::new(ctx, provisioner);
//!
//! let deployment = controller.create(CreateRequest::new("dev").with_ttl("3d")).await?;
//! println!("Created {} on port {:?}", deployment.id, deployment.ingress_port);
//! # Ok(())
//! # }
//! ```
//!
//! # State Machine
//!
//! - `Provisioning` → `Running`, `Failed`, or `Destroying`
//! - `Running` ⇄ `Stopped`; both → `Destroying` or `Failed`
//! - `Destroying` → `Destroyed`, `Expired`, or `Failed`
//! - `Failed` → `Destroying`
//!
//! See the [`lifecycle`] module for transition validation helpers.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod allocator;
pub mod catalog;
pub mod clock;
pub mod context;
pub mod duration;
pub mod error;
pub mod lifecycle;
pub mod retry;
pub mod service;
pub mod supervisor;
pub mod sweeper;
pub mod types;
pub mod usage;

pub use allocator::PortAllocator;
pub use catalog::Catalog;
pub use clock::{Clock, ManualClock, SystemClock};
pub use context::Context;
pub use duration::{format_time_remaining, parse_duration};
pub use error::{ControlError, ErrorKind, Result};
pub use retry::{retry_busy, BUSY_RETRY_BACKOFF};
pub use service::{Lifecycle, LifecycleController};
pub use supervisor::{Connectivity, TunnelSupervisor};
pub use sweeper::Sweeper;
pub use types::{CreateRequest, ListFilter, ProfileInfo, SweepReport};
pub use usage::Invocation;

// Re-export commonly used types from dependencies for convenience
pub use devbox_core::{DeploymentId, Operation, PortKind, SourceId};
pub use devbox_store::{
    ConnectionProfile, Deployment, DeploymentState, Preset, ProfileStatus, SourceDefinition,
};
