//! The `config.json` singleton document.
//!
//! Loaded once per invocation and handed to the components that need it.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::types::{Preset, SourceDefinition};

/// User-level configuration for devbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevboxConfig {
    /// Identity stamped on records and usage events.
    #[serde(default)]
    pub user_profile: UserProfile,

    /// Tags applied to every new deployment.
    #[serde(default = "DevboxConfig::default_tags")]
    pub default_tags: BTreeMap<String, String>,

    /// Cloud region recorded as a tag on new deployments.
    #[serde(default = "DevboxConfig::default_region")]
    pub default_region: String,

    /// Preset used when `create` is not given one.
    #[serde(default)]
    pub default_preset: Preset,

    /// TTL used when `create` is not given one (e.g. `7d`).
    #[serde(default = "DevboxConfig::default_expiration")]
    pub default_expiration: String,

    /// Default SSH key name for cloud resources.
    #[serde(default = "DevboxConfig::default_key_name")]
    pub default_key_name: String,

    /// Local port ranges.
    #[serde(default)]
    pub ports: PortRanges,

    /// Upper bound on waiting for an entity lock.
    #[serde(default = "DevboxConfig::default_lock_timeout")]
    pub lock_timeout_seconds: u64,

    /// Grace period between asking a tunnel to exit and killing it.
    #[serde(default = "DevboxConfig::default_tunnel_grace")]
    pub tunnel_grace_seconds: u64,

    /// How long a record may sit in `provisioning` before the sweeper resolves it.
    #[serde(default = "DevboxConfig::default_provision_timeout")]
    pub provision_timeout_seconds: u64,

    /// Window used by the `expiring-soon` list filter.
    #[serde(default = "DevboxConfig::default_expiring_soon")]
    pub expiring_soon_hours: u64,

    /// Data sources added to, or overriding, the built-in catalog.
    #[serde(default)]
    pub sources: BTreeMap<String, SourceDefinition>,

    /// Whether first-run setup has been completed.
    #[serde(default)]
    pub setup_complete: bool,
}

impl DevboxConfig {
    fn default_tags() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("cloud".to_string(), "local".to_string()),
            ("environment".to_string(), "demo".to_string()),
        ])
    }

    fn default_region() -> String {
        "us-east-1".to_string()
    }

    fn default_expiration() -> String {
        "7d".to_string()
    }

    fn default_key_name() -> String {
        "en-field-key".to_string()
    }

    const fn default_lock_timeout() -> u64 {
        10
    }

    const fn default_tunnel_grace() -> u64 {
        5
    }

    const fn default_provision_timeout() -> u64 {
        1800 // 30 minutes
    }

    const fn default_expiring_soon() -> u64 {
        24
    }

    /// Get the lock timeout as a `Duration`.
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_seconds)
    }

    /// Get the tunnel grace period as a `Duration`.
    #[must_use]
    pub const fn tunnel_grace(&self) -> Duration {
        Duration::from_secs(self.tunnel_grace_seconds)
    }

    /// Get the stale-provisioning bound as a `chrono::Duration`.
    #[must_use]
    pub fn provision_timeout(&self) -> chrono::Duration {
        i64::try_from(self.provision_timeout_seconds)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }

    /// Get the expiring-soon window as a `chrono::Duration`.
    #[must_use]
    pub fn expiring_soon(&self) -> chrono::Duration {
        i64::try_from(self.expiring_soon_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .unwrap_or(chrono::Duration::MAX)
    }

    /// The identity to record as owner and actor, if one is configured.
    #[must_use]
    pub fn owner_email(&self) -> Option<&str> {
        self.user_profile
            .email
            .as_deref()
            .filter(|email| !email.is_empty())
    }

    /// Check cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidConfig` if a port range is empty, starts at
    /// port 0, or overlaps the other range.
    pub fn validate(&self) -> Result<()> {
        let ingress = self.ports.ingress_range();
        let tunnel = self.ports.tunnel_range();
        for (label, range) in [("ingress", &ingress), ("tunnel", &tunnel)] {
            if range.is_empty() {
                return Err(StoreError::InvalidConfig(format!(
                    "{label} port range {}-{} is empty",
                    range.start(),
                    range.end()
                )));
            }
            if *range.start() == 0 {
                return Err(StoreError::InvalidConfig(format!(
                    "{label} port range must not include port 0"
                )));
            }
        }
        if ingress.start() <= tunnel.end() && tunnel.start() <= ingress.end() {
            return Err(StoreError::InvalidConfig(format!(
                "ingress ports {}-{} overlap tunnel ports {}-{}",
                ingress.start(),
                ingress.end(),
                tunnel.start(),
                tunnel.end()
            )));
        }
        Ok(())
    }
}

impl Default for DevboxConfig {
    fn default() -> Self {
        Self {
            user_profile: UserProfile::default(),
            default_tags: Self::default_tags(),
            default_region: Self::default_region(),
            default_preset: Preset::default(),
            default_expiration: Self::default_expiration(),
            default_key_name: Self::default_key_name(),
            ports: PortRanges::default(),
            lock_timeout_seconds: Self::default_lock_timeout(),
            tunnel_grace_seconds: Self::default_tunnel_grace(),
            provision_timeout_seconds: Self::default_provision_timeout(),
            expiring_soon_hours: Self::default_expiring_soon(),
            sources: BTreeMap::new(),
            setup_complete: false,
        }
    }
}

/// Who is using this machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Email, used as deployment owner.
    #[serde(default)]
    pub email: Option<String>,
    /// Organization tag.
    #[serde(default)]
    pub org: Option<String>,
    /// Team tag.
    #[serde(default)]
    pub team: Option<String>,
}

/// Disjoint local port ranges, one per allocator namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRanges {
    /// First host port for cluster ingress and database mappings.
    #[serde(default = "PortRanges::default_ingress_start")]
    pub ingress_start: u16,
    /// Last host port for cluster mappings.
    #[serde(default = "PortRanges::default_ingress_end")]
    pub ingress_end: u16,
    /// First local port for tunnels.
    #[serde(default = "PortRanges::default_tunnel_start")]
    pub tunnel_start: u16,
    /// Last local port for tunnels.
    #[serde(default = "PortRanges::default_tunnel_end")]
    pub tunnel_end: u16,
    /// Skip ports another local process is already listening on.
    #[serde(default = "PortRanges::default_probe_host")]
    pub probe_host: bool,
}

impl PortRanges {
    const fn default_ingress_start() -> u16 {
        30000
    }

    const fn default_ingress_end() -> u16 {
        30999
    }

    const fn default_tunnel_start() -> u16 {
        1024
    }

    const fn default_tunnel_end() -> u16 {
        9999
    }

    const fn default_probe_host() -> bool {
        true
    }

    /// Ingress range, inclusive.
    #[must_use]
    pub const fn ingress_range(&self) -> RangeInclusive<u16> {
        self.ingress_start..=self.ingress_end
    }

    /// Tunnel range, inclusive.
    #[must_use]
    pub const fn tunnel_range(&self) -> RangeInclusive<u16> {
        self.tunnel_start..=self.tunnel_end
    }
}

impl Default for PortRanges {
    fn default() -> Self {
        Self {
            ingress_start: Self::default_ingress_start(),
            ingress_end: Self::default_ingress_end(),
            tunnel_start: Self::default_tunnel_start(),
            tunnel_end: Self::default_tunnel_end(),
            probe_host: Self::default_probe_host(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = DevboxConfig::default();
        assert_eq!(config.default_expiration, "7d");
        assert_eq!(config.default_preset, Preset::Development);
        assert_eq!(config.lock_timeout(), Duration::from_secs(10));
        assert_eq!(config.expiring_soon(), chrono::Duration::hours(24));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config: DevboxConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, DevboxConfig::default());
    }

    #[test]
    fn partial_ports_keep_other_defaults() {
        let config: DevboxConfig =
            serde_json::from_str(r#"{"ports": {"tunnel_start": 20000, "tunnel_end": 20010}}"#)
                .unwrap();
        assert_eq!(config.ports.tunnel_range(), 20000..=20010);
        assert_eq!(config.ports.ingress_start, 30000);
        assert!(config.ports.probe_host);
    }

    #[test]
    fn overlapping_ranges_rejected() {
        let mut config = DevboxConfig::default();
        config.ports.tunnel_end = 30005;
        assert!(matches!(
            config.validate(),
            Err(StoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn empty_email_is_no_owner() {
        let mut config = DevboxConfig::default();
        config.user_profile.email = Some(String::new());
        assert_eq!(config.owner_email(), None);
        config.user_profile.email = Some("jane@example.com".into());
        assert_eq!(config.owner_email(), Some("jane@example.com"));
    }
}
