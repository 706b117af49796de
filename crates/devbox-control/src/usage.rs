//! Usage events.
//!
//! One JSON line per lifecycle event, appended to `usage/<date>.log` for
//! external reporting. A failed append never fails the command that caused
//! it.

use devbox_core::Operation;
use devbox_store::{DevboxConfig, Outcome, Store, UsageEvent};
use uuid::Uuid;

use crate::clock::Clock;

/// Identity of one CLI invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Correlates every event this invocation records.
    pub id: Uuid,
    /// Who ran the command.
    pub actor: String,
}

impl Invocation {
    /// Create an invocation for `actor` with a fresh id.
    #[must_use]
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor: actor.into(),
        }
    }

    /// The configured email, else `$USER`, else `unknown`.
    #[must_use]
    pub fn from_config(config: &DevboxConfig) -> Self {
        let actor = config.owner_email().map_or_else(
            || {
                std::env::var("USER")
                    .ok()
                    .filter(|user| !user.is_empty())
                    .unwrap_or_else(|| "unknown".to_string())
            },
            str::to_string,
        );
        Self::new(actor)
    }
}

/// Append one usage event, logging instead of failing.
pub(crate) fn record<S: Store + ?Sized>(
    store: &S,
    clock: &dyn Clock,
    invocation: &Invocation,
    operation: Operation,
    entity: &str,
    outcome: Outcome,
    detail: Option<String>,
) {
    let event = UsageEvent {
        timestamp: clock.now(),
        invocation_id: invocation.id,
        actor: invocation.actor.clone(),
        operation,
        entity: entity.to_string(),
        outcome,
        detail,
    };
    if let Err(err) = store.append_usage(&event) {
        tracing::warn!(%operation, entity, error = %err, "Failed to record usage event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};
    use devbox_store::{keys, FileStore};
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn actor_prefers_configured_email() {
        let mut config = DevboxConfig::default();
        config.user_profile.email = Some("jane.doe@example.com".into());
        assert_eq!(Invocation::from_config(&config).actor, "jane.doe@example.com");
    }

    #[test]
    fn each_invocation_gets_its_own_id() {
        assert_ne!(Invocation::new("a").id, Invocation::new("a").id);
    }

    #[test]
    fn records_one_line_per_event() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path(), Duration::from_secs(1)).unwrap();
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap();
        let clock = ManualClock::new(at);
        let invocation = Invocation::new("jane.doe@example.com");

        record(
            &store,
            &clock,
            &invocation,
            Operation::Create,
            "jane-doe-dev-1019",
            Outcome::Ok,
            None,
        );
        record(
            &store,
            &clock,
            &invocation,
            Operation::Stop,
            "jane-doe-dev-1019",
            Outcome::Noop,
            Some("already stopped".into()),
        );

        let log = std::fs::read_to_string(keys::usage_path(dir.path(), at.date_naive())).unwrap();
        let events: Vec<UsageEvent> = log
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].outcome, Outcome::Noop);
        assert!(events.iter().all(|e| e.invocation_id == invocation.id));
    }
}
