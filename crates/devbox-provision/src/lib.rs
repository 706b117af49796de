//! Local cluster provisioning for devbox deployments.
//!
//! This crate provides the [`ClusterProvisioner`] trait and the
//! [`KindProvisioner`] implementation that the lifecycle controller delegates
//! cluster bring-up to. It handles:
//!
//! - Cluster creation from a preset's node layout, with host port mappings
//! - Cost-saving stop/start by scaling workloads to zero and back
//! - Tear-down and existence checks used by reconciliation
//!
//! # Example
//!
//! ```no_run
//! use devbox_provision::{ClusterProvisioner, ClusterSpec, KindProvisioner, ProvisionerConfig};
//! use devbox_store::Preset;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let provisioner = KindProvisioner::new(ProvisionerConfig::default());
//! let spec = ClusterSpec {
//!     cluster_name: "ops-dev-1019".into(),
//!     node_spec: Preset::Development.node_spec(),
//!     ingress_port: Some(30000),
//!     postgres_port: Some(30001),
//! };
//! let handle = provisioner.provision(&spec).await?;
//! assert!(provisioner.exists(&handle).await?);
//! # Ok(())
//! # }
//! ```
//!
//! # Testing
//!
//! Enable the `test-utils` feature for an in-memory provisioner with failure
//! injection:
//!
//! ```ignore
//! use devbox_provision::{ClusterProvisioner, MockProvisioner};
//!
//! let provisioner = MockProvisioner::new();
//! provisioner.fail("provision", "docker daemon not running");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod kind;
pub mod kind_config;
pub mod types;

pub use error::{ProvisionError, Result};
pub use kind::{ClusterProvisioner, KindProvisioner};
pub use types::{ClusterSpec, ProvisionerConfig, Sizing};

#[cfg(any(test, feature = "test-utils"))]
pub use kind::mock::MockProvisioner;
