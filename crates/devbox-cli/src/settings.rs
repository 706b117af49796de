//! `devbox config set` keys.

use devbox_control::{parse_duration, ErrorKind};
use devbox_store::{DevboxConfig, Preset};

/// Keys accepted by `config set`, for help and error text.
pub const KEYS: &[&str] = &[
    "user.name",
    "user.email",
    "user.org",
    "user.team",
    "default.region",
    "default.preset",
    "default.expiration",
    "default.key-name",
    "ports.probe-host",
    "lock-timeout-seconds",
    "tunnel-grace-seconds",
    "provision-timeout-seconds",
    "expiring-soon-hours",
    "tags.<name>",
];

/// Apply one `key value` pair to `config`. An empty value clears optional
/// user fields and removes a tag.
pub fn apply(config: &mut DevboxConfig, key: &str, value: &str) -> Result<(), ErrorKind> {
    let value = value.trim();
    let optional = || (!value.is_empty()).then(|| value.to_string());

    match key {
        "user.name" => config.user_profile.name = optional(),
        "user.email" => {
            if !value.is_empty() && !value.contains('@') {
                return Err(invalid(key, value, "expected an email address"));
            }
            config.user_profile.email = optional();
        }
        "user.org" => config.user_profile.org = optional(),
        "user.team" => config.user_profile.team = optional(),
        "default.region" => config.default_region = required(key, value)?,
        "default.preset" => {
            config.default_preset = value
                .parse::<Preset>()
                .map_err(|err| invalid(key, value, &err.to_string()))?;
        }
        "default.expiration" => {
            parse_duration(value)?;
            config.default_expiration = value.to_string();
        }
        "default.key-name" => config.default_key_name = required(key, value)?,
        "ports.probe-host" => {
            config.ports.probe_host = value
                .parse()
                .map_err(|_| invalid(key, value, "expected true or false"))?;
        }
        "lock-timeout-seconds" => config.lock_timeout_seconds = number(key, value)?,
        "tunnel-grace-seconds" => config.tunnel_grace_seconds = number(key, value)?,
        "provision-timeout-seconds" => config.provision_timeout_seconds = number(key, value)?,
        "expiring-soon-hours" => config.expiring_soon_hours = number(key, value)?,
        _ => match key.strip_prefix("tags.") {
            Some(tag) if !tag.is_empty() => {
                if value.is_empty() {
                    config.default_tags.remove(tag);
                } else {
                    config.default_tags.insert(tag.to_string(), value.to_string());
                }
            }
            _ => {
                return Err(ErrorKind::InvalidArgument(format!(
                    "unknown key {key:?} (known keys: {})",
                    KEYS.join(", ")
                )))
            }
        },
    }
    Ok(())
}

fn invalid(key: &str, value: &str, why: &str) -> ErrorKind {
    ErrorKind::InvalidArgument(format!("{key} = {value:?}: {why}"))
}

fn required(key: &str, value: &str) -> Result<String, ErrorKind> {
    if value.is_empty() {
        Err(invalid(key, value, "must not be empty"))
    } else {
        Ok(value.to_string())
    }
}

fn number(key: &str, value: &str) -> Result<u64, ErrorKind> {
    match value.parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(invalid(key, value, "expected a positive whole number")),
    }
}
