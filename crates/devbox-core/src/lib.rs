//! Core types and utilities for devbox.
//!
//! This crate provides the foundational types used throughout the devbox workspace:
//!
//! - **Identifiers**: Strongly-typed IDs for deployments and data sources
//! - **Handles**: Opaque references to clusters and background processes
//! - **Vocabulary**: Cloud providers, port kinds, and the operations a command can attempt
//! - **Error types**: Common error definitions shared across crates
//!
//! # Example
//!
//! ```
//! use chrono::NaiveDate;
//! use devbox_core::{DeploymentId, SourceId};
//!
//! let date = NaiveDate::from_ymd_opt(2026, 3, 9).unwrap();
//! let id = DeploymentId::derive("dev", "jane.doe@example.com", date).unwrap();
//! assert_eq!(id.as_str(), "jane-doe-dev-0309");
//!
//! let source = SourceId::parse("aws-postgres").unwrap();
//! assert_eq!(source.as_str(), "aws-postgres");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod handles;
pub mod ids;
pub mod types;

pub use error::{CoreError, Result};
pub use handles::{ClusterHandle, ProcessHandle};
pub use ids::{sanitize_name, validate_name, DeploymentId, IdError, SourceId};
pub use types::{Operation, PortKind, Provider};
