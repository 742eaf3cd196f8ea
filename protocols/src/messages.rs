//! Bus message envelopes and payloads.
//!
//! Every message published on the registry channels is wrapped in an
//! [`Envelope`] carrying a correlation id for request/response pairing and
//! the sender identity for self-message filtering.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::LogicalSlot;
use crate::id::{EntityId, ServerId, SlotId};

/// Pub/sub channel names used by the registry.
pub mod channels {
    pub const REGISTRATION: &str = "fulcrum:registry:registration";
    pub const HEARTBEAT: &str = "fulcrum:registry:heartbeat";
    pub const ROUTE: &str = "fulcrum:registry:route";
    pub const EVENTS: &str = "fulcrum:registry:events";
}

/// Wire envelope for all registry traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub correlation_id: Uuid,
    /// Identity of the publishing process (own server/proxy id).
    pub sender: String,
    pub payload: BusMessage,
}

impl Envelope {
    pub fn new(sender: impl Into<String>, payload: BusMessage) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            sender: sender.into(),
            payload,
        }
    }

    /// Build a response that keeps the originating correlation id.
    pub fn reply(&self, sender: impl Into<String>, payload: BusMessage) -> Self {
        Self {
            correlation_id: self.correlation_id,
            sender: sender.into(),
            payload,
        }
    }

    pub fn is_from(&self, identity: &str) -> bool {
        self.sender == identity
    }
}

/// All registry message payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMessage {
    RegisterServer(ServerRegistration),
    RegisterProxy(ProxyRegistration),
    RegistrationAccepted {
        temp_id: String,
        assigned: EntityId,
    },
    RegistrationRejected {
        temp_id: String,
        reason: String,
    },
    Heartbeat(HeartbeatReport),
    /// Deliberate, graceful shutdown announcement from an entity.
    Shutdown {
        entity: EntityId,
    },
    RouteRequest(RouteRequest),
    RouteResponse {
        player: String,
        outcome: RouteOutcome,
    },
    /// Player landed on the assigned slot; consumes the reservation.
    RouteConfirm {
        player: String,
        slot_id: SlotId,
        reservation: Uuid,
    },
    RouteConfirmed {
        player: String,
        slot_id: SlotId,
    },
    SlotRegistered(LogicalSlot),
    SlotRemoved {
        slot_id: SlotId,
    },
    CapacityChanged {
        server_id: ServerId,
        family: String,
        remaining: u32,
        /// Whether the server still advertises this family.
        advertising: bool,
    },
    EntityUnavailable {
        entity: EntityId,
    },
    EntityReleased {
        entity: EntityId,
    },
}

/// Bootstrap-phase server registration request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRegistration {
    /// Caller-chosen identifier used until a permanent id is assigned.
    pub temp_id: String,
    pub host: String,
    pub port: u16,
    /// Family the server's identifier is drawn from (`mini` -> `mini1`).
    pub server_type: String,
    /// Declared player capacity per slot family.
    #[serde(default)]
    pub capacity: HashMap<String, u32>,
    /// Previously assigned id being re-claimed after a restart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_id: Option<ServerId>,
}

/// Bootstrap-phase proxy registration request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyRegistration {
    pub temp_id: String,
    pub host: String,
    pub port: u16,
}

/// Periodic liveness report from a registered entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatReport {
    pub entity: EntityId,
    /// Unix milliseconds at the sender when the report was emitted.
    pub sent_at_ms: u64,
    #[serde(default)]
    pub online_players: u32,
}

/// A player placement request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRequest {
    pub player: String,
    pub family: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    /// Rejoin target; bypasses its own entry in `blocked_slots`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_slot: Option<SlotId>,
    /// Slots the player must not be routed to right now.
    #[serde(default)]
    pub blocked_slots: Vec<SlotId>,
    #[serde(default)]
    pub rejoin: bool,
}

/// Final disposition of a placement request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RouteOutcome {
    Assigned {
        slot_id: SlotId,
        server_id: ServerId,
        /// Token the player presents in the follow-up confirm.
        reservation: Uuid,
    },
    Requeued {
        retries: u32,
    },
    Failed {
        reason: RouteFailure,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteFailure {
    NoCapacity,
    RetriesExhausted,
    WaitExceeded,
    ReservationExpired,
    ReservationMismatch,
}

impl std::fmt::Display for RouteFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteFailure::NoCapacity => write!(f, "no_capacity"),
            RouteFailure::RetriesExhausted => write!(f, "retries_exhausted"),
            RouteFailure::WaitExceeded => write!(f, "wait_exceeded"),
            RouteFailure::ReservationExpired => write!(f, "reservation_expired"),
            RouteFailure::ReservationMismatch => write!(f, "reservation_mismatch"),
        }
    }
}
