//! Error types for the provision crate.

use thiserror::Error;

/// Errors that can occur while provisioning or scaling a cluster.
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// An external tool exited unsuccessfully. `output` is its stderr, unmodified.
    #[error("`{command}` failed: {output}")]
    CommandFailed {
        /// The command line that failed.
        command: String,
        /// The tool's own error text.
        output: String,
    },

    /// An external tool could not be started at all.
    #[error("could not run `{command}`: {source}")]
    Spawn {
        /// The command line that was attempted.
        command: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Kubernetes API error.
    #[error("Kubernetes API error: {0}")]
    KubeApi(#[from] kube::Error),

    /// The kubeconfig context for a cluster could not be loaded.
    #[error("kubeconfig error for context {context}: {message}")]
    Kubeconfig {
        /// Context that was requested.
        context: String,
        /// Loader message.
        message: String,
    },

    /// The cluster spec cannot be provisioned.
    #[error("invalid cluster spec: {0}")]
    InvalidSpec(String),

    /// The cluster does not exist.
    #[error("cluster not found: {0}")]
    ClusterNotFound(String),
}

impl ProvisionError {
    /// The external tool's own output, when the failure came from one.
    #[must_use]
    pub fn tool_output(&self) -> Option<&str> {
        match self {
            Self::CommandFailed { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// A specialized Result type for provision operations.
pub type Result<T> = std::result::Result<T, ProvisionError>;
