//! Common error types for devbox.
//!
//! This module provides shared error types that are used across multiple crates.

use thiserror::Error;

/// A result type using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur throughout the devbox workspace.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] crate::ids::IdError),

    /// A string did not name a known variant of an enumeration.
    #[error("unknown {kind}: {value}")]
    UnknownVariant {
        /// What was being parsed (e.g. "provider").
        kind: &'static str,
        /// The rejected input.
        value: String,
    },
}
