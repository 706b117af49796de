//! Deployment lifecycle state machine.
//!
//! This module defines the valid state transitions for deployments and
//! provides validation logic to ensure state machine invariants are
//! maintained.
//!
//! # State Machine
//!
//! ```text
//!   Provisioning ───▶ Running ◀───▶ Stopped
//!        │               │             │
//!        └───────────────┼─────────────┘
//!                        ▼
//!    Failed ◀──────▶ Destroying ───▶ Expired
//!                        │              │
//!                        ▼              │
//!                    Destroyed ◀────────┘
//! ```
//!
//! `Provisioning`, `Running` and `Stopped` also reach `Failed` directly, on a
//! provisioner error or when the reconciler finds the cluster gone.

use devbox_core::DeploymentId;
use devbox_core::Operation;
use devbox_store::DeploymentState;

use crate::error::{ControlError, ErrorKind, Result};

/// Validates a state transition and returns the target state if valid.
///
/// # Errors
///
/// Returns `ErrorKind::InvalidState` if the transition is not allowed.
pub fn validate_transition(
    operation: Operation,
    id: &DeploymentId,
    from: DeploymentState,
    to: DeploymentState,
) -> Result<DeploymentState> {
    if is_valid_transition(from, to) {
        Ok(to)
    } else {
        Err(ControlError::new(
            operation,
            id,
            ErrorKind::InvalidState {
                from: from.to_string(),
                to: to.to_string(),
            },
        ))
    }
}

/// Checks if a state transition is valid.
///
/// # State Transition Rules
///
/// - `Provisioning` → `Running`, `Failed`, `Destroying`
/// - `Running` → `Stopped`, `Destroying`, `Failed`
/// - `Stopped` → `Running`, `Destroying`, `Failed`
/// - `Destroying` → `Destroyed`, `Expired`, `Failed`
/// - `Failed` → `Destroying`
/// - `Expired` → `Destroyed`
/// - `Destroyed` → (none)
#[must_use]
pub const fn is_valid_transition(from: DeploymentState, to: DeploymentState) -> bool {
    use DeploymentState::{Destroyed, Destroying, Expired, Failed, Provisioning, Running, Stopped};

    matches!(
        (from, to),
        (Provisioning, Running | Failed | Destroying)
            | (Running, Stopped | Destroying | Failed)
            | (Stopped, Running | Destroying | Failed)
            | (Destroying, Destroyed | Expired | Failed)
            | (Failed, Destroying)
            | (Expired, Destroyed)
    )
}

/// Returns all valid target states from a given state.
#[must_use]
pub fn valid_transitions_from(state: DeploymentState) -> Vec<DeploymentState> {
    use DeploymentState::{Destroyed, Destroying, Expired, Failed, Provisioning, Running, Stopped};

    [
        Provisioning,
        Running,
        Stopped,
        Destroying,
        Destroyed,
        Failed,
        Expired,
    ]
    .into_iter()
    .filter(|&to| is_valid_transition(state, to))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use DeploymentState::{Destroyed, Destroying, Expired, Failed, Provisioning, Running, Stopped};

    #[test]
    fn valid_provisioning_transitions() {
        assert!(is_valid_transition(Provisioning, Running));
        assert!(is_valid_transition(Provisioning, Failed));
        assert!(!is_valid_transition(Provisioning, Stopped));
    }

    #[test]
    fn stop_and_start_cycle() {
        assert!(is_valid_transition(Running, Stopped));
        assert!(is_valid_transition(Stopped, Running));
        assert!(!is_valid_transition(Running, Running));
    }

    #[test]
    fn failed_only_accepts_destroy() {
        assert_eq!(valid_transitions_from(Failed), vec![Destroying]);
    }

    #[test]
    fn destroyed_is_final() {
        assert!(valid_transitions_from(Destroyed).is_empty());
    }

    #[test]
    fn expiry_goes_through_destroying() {
        assert!(!is_valid_transition(Running, Expired));
        assert!(is_valid_transition(Destroying, Expired));
        assert_eq!(valid_transitions_from(Expired), vec![Destroyed]);
    }

    #[test]
    fn validate_transition_error() {
        let id = DeploymentId::parse("ops-dev-1019").unwrap();
        let err = validate_transition(Operation::Start, &id, Running, Running).unwrap_err();
        assert_eq!(err.operation, Operation::Start);
        assert_eq!(err.entity, "ops-dev-1019");
        assert!(matches!(err.kind, ErrorKind::InvalidState { .. }));
    }
}
