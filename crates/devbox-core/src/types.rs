//! Shared vocabulary: providers, port kinds, and operations.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Cloud provider hosting a shared data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// Amazon Web Services.
    Aws,
    /// Google Cloud Platform.
    Gcp,
    /// Microsoft Azure.
    Azure,
}

impl Provider {
    /// Lowercase name used in documents and on the command line.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Aws => "aws",
            Self::Gcp => "gcp",
            Self::Azure => "azure",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aws" => Ok(Self::Aws),
            "gcp" => Ok(Self::Gcp),
            "azure" => Ok(Self::Azure),
            other => Err(CoreError::UnknownVariant {
                kind: "provider",
                value: other.to_string(),
            }),
        }
    }
}

/// The allocator namespace a local port is drawn from.
///
/// Each kind has its own disjoint range so cluster ports never collide with
/// tunnel ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortKind {
    /// Host ports mapped into a local cluster (ingress, database sidecar).
    Ingress,
    /// Local ends of secure tunnels to remote data sources.
    Tunnel,
}

impl PortKind {
    /// Lowercase name used in error messages and the ledger.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ingress => "ingress",
            Self::Tunnel => "tunnel",
        }
    }
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An operation a command can attempt, used to label errors and usage events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Create a deployment.
    Create,
    /// Start a stopped deployment.
    Start,
    /// Stop a running deployment.
    Stop,
    /// Extend a deployment's expiry.
    Extend,
    /// Destroy a deployment.
    Destroy,
    /// Expire a deployment (sweeper-driven destroy).
    Expire,
    /// List deployments or profiles.
    List,
    /// Enable a data-source tunnel.
    Enable,
    /// Disable a data-source tunnel.
    Disable,
    /// Report a data-source tunnel's live status.
    Info,
    /// Mark a tunnel degraded after its process died.
    Degrade,
    /// Run a reconciliation pass.
    Sweep,
    /// Read or write the configuration document.
    Configure,
}

impl Operation {
    /// Lowercase verb.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Extend => "extend",
            Self::Destroy => "destroy",
            Self::Expire => "expire",
            Self::List => "list",
            Self::Enable => "enable",
            Self::Disable => "disable",
            Self::Info => "info",
            Self::Degrade => "degrade",
            Self::Sweep => "sweep",
            Self::Configure => "configure",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
