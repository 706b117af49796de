//! Error types for the controller layer.
//!
//! Every error names the operation that was attempted, the entity it was
//! attempted on, and the specific [`ErrorKind`]. The kind decides the process
//! exit code. Whether the command layer may retry also depends on whether a
//! collaborator had already acted when the error was raised.

use std::fmt;

use devbox_core::{IdError, Operation, PortKind};
use devbox_provision::ProvisionError;
use devbox_store::StoreError;
use devbox_tunnel::{CredentialError, TunnelError};
use thiserror::Error;

/// A result type using `ControlError`.
pub type Result<T> = std::result::Result<T, ControlError>;

/// A failed operation on one entity.
#[derive(Debug, Error)]
#[error("{operation} {entity} failed: {kind}")]
pub struct ControlError {
    /// What was attempted.
    pub operation: Operation,
    /// Deployment id, source id, or name the operation targeted.
    pub entity: String,
    /// What went wrong.
    pub kind: ErrorKind,
    /// A collaborator had already acted when the error was raised.
    pub side_effects: bool,
}

/// The error taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ErrorKind {
    /// The entity does not exist.
    #[error("NotFound")]
    NotFound,

    /// Another active record already holds the name.
    #[error("NameConflict: name is held by {holder}")]
    NameConflict {
        /// Id of the record holding the name.
        holder: String,
    },

    /// The transition is not allowed from the current state.
    #[error("InvalidState: cannot go from {from} to {to}")]
    InvalidState {
        /// Current state.
        from: String,
        /// Requested state.
        to: String,
    },

    /// No free port is left in the range.
    #[error("ResourceExhausted: no free {kind} port in {start}-{end}")]
    ResourceExhausted {
        /// Allocator namespace.
        kind: PortKind,
        /// First port of the range.
        start: u16,
        /// Last port of the range.
        end: u16,
    },

    /// An entity lock stayed held past the bounded wait.
    #[error("Busy: {0}")]
    Busy(String),

    /// The external resource behind a record is gone.
    #[error("ExternalResourceMissing: {0}")]
    ExternalResourceMissing(String),

    /// A collaborator failed. `message` is its own text, unmodified.
    #[error("CollaboratorFailure ({collaborator}): {message}")]
    CollaboratorFailure {
        /// Which collaborator failed.
        collaborator: &'static str,
        /// The collaborator's error text.
        message: String,
    },

    /// The tunnel for this source is already enabled.
    #[error("AlreadyEnabled: tunnel running on localhost:{local_port}")]
    AlreadyEnabled {
        /// Local end of the running tunnel.
        local_port: u16,
    },

    /// The operation needs explicit confirmation or `force`.
    #[error("ConfirmationRequired: deployment is running")]
    ConfirmationRequired,

    /// An argument was rejected before anything was touched.
    #[error("InvalidArgument: {0}")]
    InvalidArgument(String),

    /// The state root could not be read or written.
    #[error("Storage: {0}")]
    Storage(String),
}

impl ErrorKind {
    /// Process exit code for this kind: `1` user-correctable, `2` environment.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::NotFound
            | Self::NameConflict { .. }
            | Self::InvalidState { .. }
            | Self::ResourceExhausted { .. }
            | Self::AlreadyEnabled { .. }
            | Self::ConfirmationRequired
            | Self::InvalidArgument(_) => 1,
            Self::Busy(_)
            | Self::ExternalResourceMissing(_)
            | Self::CollaboratorFailure { .. }
            | Self::Storage(_) => 2,
        }
    }

    /// Returns true if the command layer may retry the operation.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}

impl ControlError {
    /// Create an error for `operation` on `entity`.
    pub fn new(operation: Operation, entity: impl fmt::Display, kind: ErrorKind) -> Self {
        Self {
            operation,
            entity: entity.to_string(),
            kind,
            side_effects: false,
        }
    }

    /// Mark the error as raised after a collaborator acted. Such an error is
    /// never retriable: re-running the operation would repeat the action.
    #[must_use]
    pub const fn after_side_effects(mut self) -> Self {
        self.side_effects = true;
        self
    }

    /// Process exit code for this error.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        self.kind.exit_code()
    }

    /// Returns true if the command layer may retry the operation.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        !self.side_effects && self.kind.is_retriable()
    }
}

impl From<StoreError> for ErrorKind {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => Self::NotFound,
            StoreError::Busy { .. } => Self::Busy(err.to_string()),
            StoreError::InvalidConfig(message) => Self::InvalidArgument(message),
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<ProvisionError> for ErrorKind {
    fn from(err: ProvisionError) -> Self {
        let message = err
            .tool_output()
            .map_or_else(|| err.to_string(), str::to_string);
        Self::CollaboratorFailure {
            collaborator: "provisioner",
            message,
        }
    }
}

impl From<TunnelError> for ErrorKind {
    fn from(err: TunnelError) -> Self {
        match err {
            TunnelError::Credential(inner) => inner.into(),
            other => Self::CollaboratorFailure {
                collaborator: "tunnel launcher",
                message: other
                    .tool_output()
                    .map_or_else(|| other.to_string(), str::to_string),
            },
        }
    }
}

impl From<CredentialError> for ErrorKind {
    fn from(err: CredentialError) -> Self {
        Self::CollaboratorFailure {
            collaborator: "credential resolver",
            message: err.to_string(),
        }
    }
}

impl From<IdError> for ErrorKind {
    fn from(err: IdError) -> Self {
        Self::InvalidArgument(err.to_string())
    }
}

/// Attach an operation and entity to a lower-layer error.
pub trait During<T> {
    /// Convert the error into a [`ControlError`] for `operation` on `entity`.
    ///
    /// # Errors
    ///
    /// Returns the converted error if `self` is an error.
    fn during(self, operation: Operation, entity: impl fmt::Display) -> Result<T>;
}

impl<T, E> During<T> for std::result::Result<T, E>
where
    E: Into<ErrorKind>,
{
    fn during(self, operation: Operation, entity: impl fmt::Display) -> Result<T> {
        self.map_err(|err| ControlError::new(operation, entity, err.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_split_user_and_environment() {
        assert_eq!(ErrorKind::NotFound.exit_code(), 1);
        assert_eq!(
            ErrorKind::NameConflict {
                holder: "ops-dev-1019".into()
            }
            .exit_code(),
            1
        );
        assert_eq!(ErrorKind::ConfirmationRequired.exit_code(), 1);
        assert_eq!(ErrorKind::Busy("lock".into()).exit_code(), 2);
        assert_eq!(
            ErrorKind::CollaboratorFailure {
                collaborator: "provisioner",
                message: "boom".into()
            }
            .exit_code(),
            2
        );
    }

    #[test]
    fn only_busy_is_retriable() {
        assert!(ErrorKind::Busy("lock".into()).is_retriable());
        assert!(!ErrorKind::NotFound.is_retriable());
        assert!(!ErrorKind::ExternalResourceMissing("cluster".into()).is_retriable());
    }

    #[test]
    fn busy_after_side_effects_is_final() {
        let busy = ControlError::new(
            Operation::Destroy,
            "ops-dev-1019",
            ErrorKind::Busy("ledger".into()),
        );
        assert!(busy.is_retriable());
        let busy = busy.after_side_effects();
        assert!(!busy.is_retriable());
        assert_eq!(busy.exit_code(), 2);
    }

    #[test]
    fn message_names_operation_entity_and_kind() {
        let err = ControlError::new(
            Operation::Start,
            "ops-dev-1019",
            ErrorKind::InvalidState {
                from: "running".into(),
                to: "running".into(),
            },
        );
        assert_eq!(
            err.to_string(),
            "start ops-dev-1019 failed: InvalidState: cannot go from running to running"
        );
    }

    #[test]
    fn provisioner_text_is_preserved() {
        let source = ProvisionError::CommandFailed {
            command: "kind create cluster".into(),
            output: "ERROR: failed to create cluster: node(s) already exist".into(),
        };
        let err: Result<()> = Err(source).during(Operation::Create, "ops-dev-1019");
        let kind = err.unwrap_err().kind;
        assert_eq!(
            kind,
            ErrorKind::CollaboratorFailure {
                collaborator: "provisioner",
                message: "ERROR: failed to create cluster: node(s) already exist".into(),
            }
        );
    }

    #[test]
    fn store_busy_maps_to_busy() {
        let source = StoreError::Busy {
            key: "deployment:ops-dev-1019".into(),
            waited_ms: 10_000,
        };
        let kind: ErrorKind = source.into();
        assert!(kind.is_retriable());
    }
}
