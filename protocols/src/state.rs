//! Registration lifecycle states.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a registered server or proxy.
///
/// Transitions are driven externally by heartbeat receipt, timeout
/// detection, and explicit shutdown or reclaim decisions; this enum only
/// knows which edges are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationState {
    /// Registered, awaiting the first heartbeat.
    #[default]
    Pending,
    /// Heartbeats current.
    Active,
    /// Heartbeat timeout exceeded; retained for the reclaim window.
    Unavailable,
    /// Identifier and all associated slots freed. Terminal.
    Released,
}

impl RegistrationState {
    /// Whether moving to `next` is a legal lifecycle edge.
    pub fn can_transition_to(self, next: RegistrationState) -> bool {
        use RegistrationState::*;
        matches!(
            (self, next),
            (Pending, Active)
                | (Pending, Released)
                | (Active, Unavailable)
                | (Active, Released)
                | (Unavailable, Active)
                | (Unavailable, Released)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RegistrationState::Released)
    }
}

impl std::fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistrationState::Pending => write!(f, "pending"),
            RegistrationState::Active => write!(f, "active"),
            RegistrationState::Unavailable => write!(f, "unavailable"),
            RegistrationState::Released => write!(f, "released"),
        }
    }
}

impl std::str::FromStr for RegistrationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("pending") {
            Ok(RegistrationState::Pending)
        } else if s.eq_ignore_ascii_case("active") {
            Ok(RegistrationState::Active)
        } else if s.eq_ignore_ascii_case("unavailable") {
            Ok(RegistrationState::Unavailable)
        } else if s.eq_ignore_ascii_case("released") {
            Ok(RegistrationState::Released)
        } else {
            Err(format!("Unknown registration state: {}", s))
        }
    }
}
