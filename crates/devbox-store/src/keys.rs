//! Path encoding for documents and locks.
//!
//! Every document lives at a path derived purely from its entity key, so two
//! invocations that agree on the key agree on the file.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use devbox_core::{DeploymentId, SourceId};

use crate::lock::LockKey;
use crate::schema::layout;

/// Directory holding one deployment's documents.
#[must_use]
pub fn deployment_dir(root: &Path, id: &DeploymentId) -> PathBuf {
    root.join(layout::DEPLOYMENTS_DIR).join(id.as_str())
}

/// Path of a deployment record.
#[must_use]
pub fn metadata_path(root: &Path, id: &DeploymentId) -> PathBuf {
    deployment_dir(root, id).join(layout::METADATA_FILE)
}

/// Directory holding one data source's documents.
#[must_use]
pub fn source_dir(root: &Path, source_id: &SourceId) -> PathBuf {
    root.join(layout::CONNECTIVITY_DIR).join(source_id.as_str())
}

/// Path of a connection profile.
#[must_use]
pub fn profile_path(root: &Path, source_id: &SourceId) -> PathBuf {
    source_dir(root, source_id).join(layout::PROFILE_FILE)
}

/// Path of the usage log for a calendar day.
#[must_use]
pub fn usage_path(root: &Path, date: NaiveDate) -> PathBuf {
    root.join(layout::USAGE_DIR)
        .join(format!("{}.log", date.format("%Y-%m-%d")))
}

/// Path of the lock file guarding an entity.
#[must_use]
pub fn lock_path(root: &Path, key: &LockKey) -> PathBuf {
    root.join(layout::LOCKS_DIR)
        .join(format!("{}.lock", key.file_stem()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_paths() {
        let root = Path::new("/state");
        let id = DeploymentId::parse("ops-dev-1019").unwrap();
        assert_eq!(
            metadata_path(root, &id),
            PathBuf::from("/state/deployments/ops-dev-1019/metadata.json")
        );

        let source = SourceId::parse("aws-postgres").unwrap();
        assert_eq!(
            profile_path(root, &source),
            PathBuf::from("/state/connectivity/aws-postgres/profile.json")
        );
    }

    #[test]
    fn usage_is_daily() {
        let date = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        assert_eq!(
            usage_path(Path::new("/state"), date),
            PathBuf::from("/state/usage/2026-10-19.log")
        );
    }

    #[test]
    fn lock_paths_are_distinct_per_kind() {
        let root = Path::new("/state");
        let id = DeploymentId::parse("dev").unwrap();
        let deployment = lock_path(root, &LockKey::Deployment(id));
        let name = lock_path(root, &LockKey::name("dev"));
        assert_ne!(deployment, name);
        assert!(deployment.starts_with("/state/locks"));
    }
}
