//! Error types for the storage layer.

use std::path::PathBuf;

use thiserror::Error;

/// A result type using `StoreError`.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested record was not found.
    #[error("record not found: {entity}")]
    NotFound {
        /// Label of the missing entity.
        entity: String,
    },

    /// An entity lock could not be acquired within the configured bound.
    #[error("lock on {key} still held by another invocation after {waited_ms}ms")]
    Busy {
        /// Label of the contended lock.
        key: String,
        /// How long the acquisition waited before giving up.
        waited_ms: u64,
    },

    /// A mutation was attempted with a guard for a different entity.
    #[error("mutation of {expected} requires its lock, but the guard is for {held}")]
    LockNotHeld {
        /// Lock the mutation needs.
        expected: String,
        /// Lock the caller presented.
        held: String,
    },

    /// A filesystem operation failed.
    #[error("i/o error at {path}: {source}")]
    Io {
        /// Path the operation touched.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error at {path}: {message}")]
    Serialization {
        /// Document path.
        path: PathBuf,
        /// Parser message.
        message: String,
    },

    /// The configuration document is inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns true if this error is lock contention.
    #[must_use]
    pub const fn is_busy(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }
}
