//! Secure tunnel launcher.
//!
//! Tunnels are `ssh -N -L` processes started in their own process group so
//! they keep running after the invoking command exits. Only the process id is
//! kept; later invocations check and terminate the process through it.

use std::fs::OpenOptions;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use devbox_core::ProcessHandle;

use crate::credentials::Credential;
use crate::error::{Result, TunnelError};
use crate::types::{TunnelConfig, TunnelRequest};

const TERMINATE_POLL: Duration = Duration::from_millis(100);
const KILL_SETTLE: Duration = Duration::from_secs(1);

/// The `TunnelLauncher` trait defines the interface for tunnel processes.
#[async_trait]
pub trait TunnelLauncher: Send + Sync {
    /// Start a detached tunnel process.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be started or exits during its
    /// startup window.
    async fn start(&self, request: &TunnelRequest, credential: &Credential)
        -> Result<ProcessHandle>;

    /// Check whether the process is still running.
    async fn is_alive(&self, handle: ProcessHandle) -> bool;

    /// Ask the process to exit, wait up to `grace`, then kill it.
    ///
    /// Terminating a process that is already gone succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the process survives a forced kill.
    async fn terminate(&self, handle: ProcessHandle, grace: Duration) -> Result<()>;
}

/// Launcher that runs the OpenSSH client.
pub struct SshTunnelLauncher {
    config: TunnelConfig,
}

impl SshTunnelLauncher {
    /// Create a launcher.
    #[must_use]
    pub const fn new(config: TunnelConfig) -> Self {
        Self { config }
    }

    /// Build the `ssh` argument list for a request.
    #[must_use]
    pub fn ssh_args(&self, request: &TunnelRequest, credential: &Credential) -> Vec<String> {
        let mut args = vec![
            "-N".to_string(),
            "-o".to_string(),
            "ExitOnForwardFailure=yes".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!(
                "ServerAliveInterval={}",
                self.config.server_alive_interval_seconds
            ),
            "-p".to_string(),
            self.config.bastion_port.to_string(),
        ];
        if let Credential::IdentityFile(path) = credential {
            args.push("-o".to_string());
            args.push("IdentitiesOnly=yes".to_string());
            args.push("-i".to_string());
            args.push(path.display().to_string());
        }
        args.push("-L".to_string());
        args.push(format!(
            "127.0.0.1:{}:{}:{}",
            request.local_port, request.target_host, request.remote_port
        ));
        args.push(format!(
            "{}@{}",
            self.config.bastion_user, request.bastion_host
        ));
        args
    }
}

#[async_trait]
impl TunnelLauncher for SshTunnelLauncher {
    async fn start(
        &self,
        request: &TunnelRequest,
        credential: &Credential,
    ) -> Result<ProcessHandle> {
        let stderr = match &request.log_path {
            Some(path) => {
                if let Some(dir) = path.parent() {
                    std::fs::create_dir_all(dir).map_err(|source| TunnelError::Log {
                        path: path.clone(),
                        source,
                    })?;
                }
                let file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(path)
                    .map_err(|source| TunnelError::Log {
                        path: path.clone(),
                        source,
                    })?;
                Stdio::from(file)
            }
            None => Stdio::null(),
        };

        let mut cmd = Command::new(&self.config.ssh_binary);
        cmd.args(self.ssh_args(request, credential))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(stderr)
            .kill_on_drop(false);
        if let Credential::Agent(socket) = credential {
            cmd.env("SSH_AUTH_SOCK", socket);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| TunnelError::Spawn {
            program: self.config.ssh_binary.clone(),
            source,
        })?;
        let pid = child.id().ok_or_else(|| TunnelError::ExitedEarly {
            status: "no pid".to_string(),
            output: String::new(),
        })?;

        match tokio::time::timeout(self.config.startup_window(), child.wait()).await {
            Ok(Ok(status)) => {
                let output = request
                    .log_path
                    .as_ref()
                    .and_then(|p| std::fs::read_to_string(p).ok())
                    .unwrap_or_default()
                    .trim()
                    .to_string();
                warn!(pid, %status, "Tunnel exited during startup");
                Err(TunnelError::ExitedEarly {
                    status: status.to_string(),
                    output,
                })
            }
            Ok(Err(source)) => Err(TunnelError::Spawn {
                program: self.config.ssh_binary.clone(),
                source,
            }),
            Err(_) => {
                info!(
                    pid,
                    local_port = request.local_port,
                    bastion = %request.bastion_host,
                    "Tunnel started"
                );
                Ok(ProcessHandle::from_raw(pid))
            }
        }
    }

    async fn is_alive(&self, handle: ProcessHandle) -> bool {
        process_is_alive(handle.raw()).await
    }

    async fn terminate(&self, handle: ProcessHandle, grace: Duration) -> Result<()> {
        let pid = handle.raw();
        if !process_is_alive(pid).await {
            debug!(pid, "Tunnel already gone");
            return Ok(());
        }

        send_signal(pid, "TERM").await;
        if wait_for_exit(pid, grace).await {
            debug!(pid, "Tunnel exited after SIGTERM");
            return Ok(());
        }

        warn!(pid, grace_secs = grace.as_secs(), "Tunnel ignored SIGTERM, killing");
        send_signal(pid, "KILL").await;
        if wait_for_exit(pid, KILL_SETTLE).await {
            Ok(())
        } else {
            Err(TunnelError::Unkillable { pid })
        }
    }
}

/// Returns true if a process with this id exists.
pub async fn process_is_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .is_ok_and(|status| status.success())
}

async fn send_signal(pid: u32, signal: &str) {
    let result = Command::new("kill")
        .arg(format!("-{signal}"))
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = result {
        warn!(pid, signal, error = %e, "Failed to invoke kill");
    }
}

async fn wait_for_exit(pid: u32, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if !process_is_alive(pid).await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(TERMINATE_POLL).await;
    }
}

/// Mock launcher for testing.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    /// A mock launcher that tracks fake processes in memory.
    pub struct MockTunnelLauncher {
        next_pid: Mutex<u32>,
        alive: Mutex<HashSet<u32>>,
        started: Mutex<Vec<TunnelRequest>>,
        terminated: Mutex<Vec<u32>>,
        start_failure: Mutex<Option<String>>,
    }

    impl Default for MockTunnelLauncher {
        fn default() -> Self {
            Self {
                next_pid: Mutex::new(40_000),
                alive: Mutex::new(HashSet::new()),
                started: Mutex::new(Vec::new()),
                terminated: Mutex::new(Vec::new()),
                start_failure: Mutex::new(None),
            }
        }
    }

    impl MockTunnelLauncher {
        /// Create a new mock launcher.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Make subsequent starts fail with `output` as the tool's error text.
        pub fn fail_start(&self, output: &str) {
            *self.start_failure.lock() = Some(output.to_string());
        }

        /// Let subsequent starts succeed.
        pub fn heal(&self) {
            *self.start_failure.lock() = None;
        }

        /// Kill a process behind the supervisor's back.
        pub fn kill(&self, handle: ProcessHandle) {
            self.alive.lock().remove(&handle.raw());
        }

        /// Get the number of live processes.
        #[must_use]
        pub fn alive_count(&self) -> usize {
            self.alive.lock().len()
        }

        /// Requests passed to `start`, in call order.
        #[must_use]
        pub fn started(&self) -> Vec<TunnelRequest> {
            self.started.lock().clone()
        }

        /// Pids passed to `terminate`, in call order.
        #[must_use]
        pub fn terminated(&self) -> Vec<u32> {
            self.terminated.lock().clone()
        }
    }

    #[async_trait]
    impl TunnelLauncher for MockTunnelLauncher {
        async fn start(
            &self,
            request: &TunnelRequest,
            _credential: &Credential,
        ) -> Result<ProcessHandle> {
            if let Some(output) = self.start_failure.lock().clone() {
                return Err(TunnelError::ExitedEarly {
                    status: "exit status: 255".to_string(),
                    output,
                });
            }
            let pid = {
                let mut next = self.next_pid.lock();
                *next += 1;
                *next
            };
            self.alive.lock().insert(pid);
            self.started.lock().push(request.clone());
            Ok(ProcessHandle::from_raw(pid))
        }

        async fn is_alive(&self, handle: ProcessHandle) -> bool {
            self.alive.lock().contains(&handle.raw())
        }

        async fn terminate(&self, handle: ProcessHandle, _grace: Duration) -> Result<()> {
            self.alive.lock().remove(&handle.raw());
            self.terminated.lock().push(handle.raw());
            Ok(())
        }
    }
}
