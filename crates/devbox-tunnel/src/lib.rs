//! Secure tunnels to bastion-gated data sources.
//!
//! This crate provides the collaborators the tunnel supervisor drives:
//!
//! - [`TunnelLauncher`]: start, probe, and terminate detached tunnel processes
//! - [`SshTunnelLauncher`]: the OpenSSH implementation (`ssh -N -L`)
//! - [`CredentialResolver`]: turn a stored credential reference into a usable
//!   credential for one invocation
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐     ┌────────────────────┐
//! │ Tunnel           │────▶│ CredentialResolver │
//! │ Supervisor       │     └────────────────────┘
//! │                  │     ┌────────────────────┐      ┌──────────┐
//! │                  │────▶│ TunnelLauncher     │─────▶│ ssh -N -L│──▶ bastion
//! └──────────────────┘     └────────────────────┘      └──────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use devbox_tunnel::{
//!     CredentialResolver, LocalCredentialResolver, SshTunnelLauncher, TunnelConfig,
//!     TunnelLauncher, TunnelRequest,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let credential = LocalCredentialResolver::from_env()
//!     .resolve("ssh-key:~/.ssh/platform_bastion_key")?;
//! let launcher = SshTunnelLauncher::new(TunnelConfig::default());
//! let request = TunnelRequest {
//!     bastion_host: "bastion-aws.platform.internal".into(),
//!     target_host: "postgres-aws.platform.internal".into(),
//!     local_port: 5432,
//!     remote_port: 5432,
//!     log_path: None,
//! };
//! let handle = launcher.start(&request, &credential).await?;
//! launcher.terminate(handle, Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod credentials;
pub mod error;
pub mod launcher;
pub mod types;

pub use credentials::{Credential, CredentialResolver, LocalCredentialResolver};
pub use error::{CredentialError, Result, TunnelError};
pub use launcher::{process_is_alive, SshTunnelLauncher, TunnelLauncher};
pub use types::{TunnelConfig, TunnelRequest};

#[cfg(any(test, feature = "test-utils"))]
pub use credentials::MockCredentialResolver;
#[cfg(any(test, feature = "test-utils"))]
pub use launcher::mock::MockTunnelLauncher;
