//! Per-entity advisory file locks.
//!
//! Each entity (a deployment, a deployment name, a connection profile, the
//! ledger, the config document) has its own lock file under `locks/`. Locks
//! are exclusive, held by an [`EntityLock`] guard, and released when the guard
//! is dropped or when the holding process exits, so a crashed invocation never
//! leaves an entity wedged.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

use devbox_core::{DeploymentId, SourceId};
use fs2::FileExt;

use crate::error::{Result, StoreError};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Identifies the entity a lock guards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockKey {
    /// A deployment record.
    Deployment(DeploymentId),
    /// A deployment name (held while checking and claiming name uniqueness).
    Name(String),
    /// A connection profile.
    Profile(SourceId),
    /// The allocation ledger.
    Ledger,
    /// The configuration document.
    Config,
}

impl LockKey {
    /// Lock on a deployment name. Names compare case-insensitively.
    #[must_use]
    pub fn name(name: &str) -> Self {
        Self::Name(name.to_ascii_lowercase())
    }

    /// File name (without extension) of the lock file.
    #[must_use]
    pub fn file_stem(&self) -> String {
        match self {
            Self::Deployment(id) => format!("deployment-{id}"),
            Self::Name(name) => format!("name-{name}"),
            Self::Profile(source) => format!("profile-{source}"),
            Self::Ledger => "ledger".to_string(),
            Self::Config => "config".to_string(),
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deployment(id) => write!(f, "deployment:{id}"),
            Self::Name(name) => write!(f, "name:{name}"),
            Self::Profile(source) => write!(f, "profile:{source}"),
            Self::Ledger => f.write_str("ledger"),
            Self::Config => f.write_str("config"),
        }
    }
}

/// An exclusive lock on one entity, released on drop.
#[derive(Debug)]
pub struct EntityLock {
    file: File,
    key: LockKey,
}

impl EntityLock {
    /// The entity this guard locks.
    #[must_use]
    pub const fn key(&self) -> &LockKey {
        &self.key
    }

    /// Check that this guard covers `expected`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::LockNotHeld` if the guard is for another entity.
    pub fn ensure(&self, expected: &LockKey) -> Result<()> {
        if &self.key == expected {
            Ok(())
        } else {
            Err(StoreError::LockNotHeld {
                expected: expected.to_string(),
                held: self.key.to_string(),
            })
        }
    }
}

impl Drop for EntityLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(lock = %self.key, error = %e, "Failed to release lock");
        } else {
            tracing::trace!(lock = %self.key, "Released lock");
        }
    }
}

/// Acquire an exclusive lock on `path`, polling until `timeout` elapses.
pub(crate) fn acquire(path: &Path, key: LockKey, timeout: Duration) -> Result<EntityLock> {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|e| StoreError::io(path, e))?;

    let started = Instant::now();
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => {
                tracing::trace!(lock = %key, "Acquired lock");
                return Ok(EntityLock { file, key });
            }
            Err(e) if is_contended(&e) => {
                let waited = started.elapsed();
                if waited >= timeout {
                    let waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX);
                    tracing::debug!(lock = %key, waited_ms, "Lock busy");
                    return Err(StoreError::Busy {
                        key: key.to_string(),
                        waited_ms,
                    });
                }
                std::thread::sleep(POLL_INTERVAL.min(timeout - waited));
            }
            Err(e) => return Err(StoreError::io(path, e)),
        }
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
