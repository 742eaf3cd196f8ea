//! Registration lifecycle state machine.
//!
//! Wraps the protocol-level state enum with transition validation. The
//! machine never decides *when* to move — heartbeat receipt, timeout
//! detection, and explicit shutdown drive it — it only rejects edges the
//! lifecycle does not allow.

use fulcrum_protocol::RegistrationState;
use tracing::warn;

use crate::error::{RegistryError, RegistryResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationStateMachine {
    state: RegistrationState,
}

impl Default for RegistrationStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistrationStateMachine {
    pub fn new() -> Self {
        Self {
            state: RegistrationState::Pending,
        }
    }

    pub fn state(&self) -> RegistrationState {
        self.state
    }

    /// Attempt a transition, rejecting illegal edges. The entity label is
    /// only used for diagnostics.
    pub fn transition_to(
        &mut self,
        entity: &str,
        next: RegistrationState,
    ) -> RegistryResult<RegistrationState> {
        apply(entity, &mut self.state, next)?;
        Ok(self.state)
    }

    /// Restore a persisted state verbatim, bypassing validation. The
    /// stored value is authoritative when rehydrating after a restart.
    pub fn force_set(&mut self, state: RegistrationState) {
        self.state = state;
    }
}

/// Validate and apply a transition on a raw state field. Illegal edges are
/// rejected and logged; the entity stays in its prior state.
pub fn apply(
    entity: &str,
    state: &mut RegistrationState,
    next: RegistrationState,
) -> RegistryResult<()> {
    let current = *state;
    if !current.can_transition_to(next) {
        warn!(%entity, from = %current, to = %next, "Rejected illegal state transition");
        return Err(RegistryError::IllegalTransition {
            entity: entity.to_string(),
            from: current,
            to: next,
        });
    }
    *state = next;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_lifecycle_is_legal() {
        let mut machine = RegistrationStateMachine::new();
        machine
            .transition_to("mini1", RegistrationState::Active)
            .unwrap();
        machine
            .transition_to("mini1", RegistrationState::Unavailable)
            .unwrap();
        machine
            .transition_to("mini1", RegistrationState::Active)
            .unwrap();
        machine
            .transition_to("mini1", RegistrationState::Released)
            .unwrap();
        assert_eq!(machine.state(), RegistrationState::Released);
    }

    #[test]
    fn illegal_edge_leaves_state_untouched() {
        let mut machine = RegistrationStateMachine::new();
        let err = machine
            .transition_to("mini1", RegistrationState::Unavailable)
            .unwrap_err();
        assert!(matches!(err, RegistryError::IllegalTransition { .. }));
        assert_eq!(machine.state(), RegistrationState::Pending);
    }

    #[test]
    fn nothing_leaves_released() {
        let mut machine = RegistrationStateMachine::new();
        machine.force_set(RegistrationState::Released);
        assert!(machine
            .transition_to("mini1", RegistrationState::Active)
            .is_err());
    }

    #[test]
    fn force_set_bypasses_validation() {
        let mut machine = RegistrationStateMachine::new();
        machine.force_set(RegistrationState::Unavailable);
        assert_eq!(machine.state(), RegistrationState::Unavailable);
    }
}
