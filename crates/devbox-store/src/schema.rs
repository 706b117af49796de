//! On-disk layout of the state root.
//!
//! ```text
//! <root>/
//!   config.json
//!   ledger.json
//!   deployments/<id>/metadata.json
//!   connectivity/<source_id>/profile.json
//!   usage/<YYYY-MM-DD>.log
//!   locks/<kind>-<key>.lock
//! ```

/// Directory and file names under the state root.
pub mod layout {
    /// Singleton configuration document.
    pub const CONFIG_FILE: &str = "config.json";

    /// Allocation ledger document.
    pub const LEDGER_FILE: &str = "ledger.json";

    /// Parent of per-deployment directories.
    pub const DEPLOYMENTS_DIR: &str = "deployments";

    /// Deployment record file inside its directory.
    pub const METADATA_FILE: &str = "metadata.json";

    /// Parent of per-source directories.
    pub const CONNECTIVITY_DIR: &str = "connectivity";

    /// Connection profile file inside its directory.
    pub const PROFILE_FILE: &str = "profile.json";

    /// Append-only usage event logs, one file per day.
    pub const USAGE_DIR: &str = "usage";

    /// Lock files.
    pub const LOCKS_DIR: &str = "locks";
}

/// Returns every directory that must exist under the state root.
#[must_use]
pub fn all_directories() -> Vec<&'static str> {
    vec![
        layout::DEPLOYMENTS_DIR,
        layout::CONNECTIVITY_DIR,
        layout::USAGE_DIR,
        layout::LOCKS_DIR,
    ]
}
