//! Types for the tunnel crate.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One local-to-remote port forward through a bastion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelRequest {
    /// Bastion host the tunnel connects to.
    pub bastion_host: String,
    /// Host the bastion forwards to.
    pub target_host: String,
    /// Local end, bound on 127.0.0.1.
    pub local_port: u16,
    /// Port on the target host.
    pub remote_port: u16,
    /// Where the tunnel process writes its stderr.
    pub log_path: Option<PathBuf>,
}

/// Configuration for the SSH tunnel launcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Path or name of the `ssh` binary.
    pub ssh_binary: String,
    /// Login user on the bastion.
    pub bastion_user: String,
    /// SSH port on the bastion.
    pub bastion_port: u16,
    /// How long a freshly started tunnel must survive to count as started.
    pub startup_window_ms: u64,
    /// Keep-alive interval sent to the bastion.
    pub server_alive_interval_seconds: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            ssh_binary: "ssh".to_string(),
            bastion_user: "platform-user".to_string(),
            bastion_port: 22,
            startup_window_ms: 1500,
            server_alive_interval_seconds: 30,
        }
    }
}

impl TunnelConfig {
    /// Get the startup window as a `Duration`.
    #[must_use]
    pub const fn startup_window(&self) -> Duration {
        Duration::from_millis(self.startup_window_ms)
    }
}
