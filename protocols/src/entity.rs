//! Registered fleet entities and logical slot records.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::id::{ProxyId, ServerId, SlotId};
use crate::state::RegistrationState;

/// Availability partition an entity currently lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EntityStatus {
    #[default]
    Active,
    Unavailable,
}

impl std::fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityStatus::Active => write!(f, "active"),
            EntityStatus::Unavailable => write!(f, "unavailable"),
        }
    }
}

impl std::str::FromStr for EntityStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("active") {
            Ok(EntityStatus::Active)
        } else if s.eq_ignore_ascii_case("unavailable") {
            Ok(EntityStatus::Unavailable)
        } else {
            Err(format!("Unknown entity status: {}", s))
        }
    }
}

/// A registered backend server. Owned by the registry process and persisted
/// on every mutation; unknown fields from newer writers are ignored and
/// missing optional fields default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredServer {
    pub id: ServerId,
    pub host: String,
    pub port: u16,
    /// Declared player capacity per slot family.
    #[serde(default)]
    pub capacity: HashMap<String, u32>,
    #[serde(default)]
    pub status: EntityStatus,
    #[serde(default)]
    pub state: RegistrationState,
    /// Unix milliseconds of the last heartbeat received.
    #[serde(default)]
    pub last_heartbeat_ms: u64,
    /// Set while the entity sits in the unavailable partition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unavailable_since_ms: Option<u64>,
    /// Bootstrap-phase identifier used before the permanent id was assigned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
}

impl RegisteredServer {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn touch_heartbeat(&mut self, now_ms: u64) {
        self.last_heartbeat_ms = now_ms;
    }
}

/// A registered proxy. Proxy numbers are never auto-recycled on disconnect;
/// only an explicit release decision frees them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredProxy {
    pub id: ProxyId,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub status: EntityStatus,
    #[serde(default)]
    pub state: RegistrationState,
    #[serde(default)]
    pub last_heartbeat_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unavailable_since_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
}

impl RegisteredProxy {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn touch_heartbeat(&mut self, now_ms: u64) {
        self.last_heartbeat_ms = now_ms;
    }
}

/// A logical slot: one hosted instance of a game family on a base server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalSlot {
    pub id: SlotId,
    pub server_id: ServerId,
    pub family: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    pub max_players: u32,
    #[serde(default)]
    pub online_players: u32,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl LogicalSlot {
    /// Remaining headroom on this slot alone (not the family counter).
    pub fn free_seats(&self) -> u32 {
        self.max_players.saturating_sub(self.online_players)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> RegisteredServer {
        RegisteredServer {
            id: ServerId::from("mini1"),
            host: "10.0.0.4".to_string(),
            port: 25601,
            capacity: HashMap::from([("mini".to_string(), 3)]),
            status: EntityStatus::Active,
            state: RegistrationState::Active,
            last_heartbeat_ms: 0,
            unavailable_since_ms: None,
            temp_id: None,
        }
    }

    #[test]
    fn address_joins_host_and_port() {
        assert_eq!(server().address(), "10.0.0.4:25601");
    }

    #[test]
    fn deserialization_defaults_missing_fields() {
        // A record written by an older build without the optional fields.
        let json = r#"{"id":"mini1","host":"10.0.0.4","port":25601}"#;
        let parsed: RegisteredServer = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.state, RegistrationState::Pending);
        assert_eq!(parsed.status, EntityStatus::Active);
        assert!(parsed.capacity.is_empty());
        assert!(parsed.unavailable_since_ms.is_none());
    }

    #[test]
    fn deserialization_ignores_unknown_fields() {
        let json = r#"{"id":"mini1","host":"h","port":1,"shiny_new_field":true}"#;
        assert!(serde_json::from_str::<RegisteredServer>(json).is_ok());
    }

    #[test]
    fn slot_free_seats_saturates() {
        let slot = LogicalSlot {
            id: SlotId::from("mini1A"),
            server_id: ServerId::from("mini1"),
            family: "mini".to_string(),
            variant: None,
            max_players: 8,
            online_players: 10,
            metadata: HashMap::new(),
        };
        assert_eq!(slot.free_seats(), 0);
    }
}
