//! Tunnel error types.

use std::path::PathBuf;

use thiserror::Error;

/// A result type using `TunnelError`.
pub type Result<T> = std::result::Result<T, TunnelError>;

/// Errors that can occur while launching or supervising a tunnel process.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The tunnel program could not be started.
    #[error("could not run {program}: {source}")]
    Spawn {
        /// Program that was attempted.
        program: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The tunnel process exited during its startup window. `output` is its
    /// stderr, unmodified.
    #[error("tunnel exited during startup ({status}): {output}")]
    ExitedEarly {
        /// Exit status as reported by the OS.
        status: String,
        /// The tunnel program's own error text.
        output: String,
    },

    /// The tunnel process ignored termination.
    #[error("process {pid} still alive after SIGKILL")]
    Unkillable {
        /// Process identifier.
        pid: u32,
    },

    /// The tunnel log file could not be prepared.
    #[error("tunnel log {path}: {source}")]
    Log {
        /// Log path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The credential reference could not be resolved.
    #[error(transparent)]
    Credential(#[from] CredentialError),
}

impl TunnelError {
    /// The tunnel program's own output, when the failure came from it.
    #[must_use]
    pub fn tool_output(&self) -> Option<&str> {
        match self {
            Self::ExitedEarly { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// Errors that can occur while resolving a credential reference.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    /// The reference uses a scheme this resolver does not understand.
    #[error("unsupported credential reference: {0}")]
    UnsupportedScheme(String),

    /// The referenced key file does not exist.
    #[error("SSH key not found at {0}")]
    MissingKeyFile(PathBuf),

    /// The referenced environment variable is unset or empty.
    #[error("environment variable {0} is not set")]
    MissingEnv(String),

    /// No SSH agent is reachable.
    #[error("no SSH agent available (SSH_AUTH_SOCK is not set)")]
    NoAgent,
}
