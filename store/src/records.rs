//! Field-map serialization for persisted registry records.
//!
//! Each record type spells out its stored fields explicitly. Extra fields
//! in a stored map are ignored; optional fields missing from older records
//! default. Complex values (capacity, metadata) are embedded as JSON.

use std::collections::HashMap;

use fulcrum_protocol::{
    EntityStatus, LogicalSlot, ProxyId, RegisteredProxy, RegisteredServer, RegistrationState,
    ServerId, SlotId,
};

use crate::core::HashRecord;

fn required<'a>(map: &'a HashMap<String, String>, field: &str) -> Result<&'a str, String> {
    map.get(field)
        .map(String::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| format!("missing {field}"))
}

fn parsed<T: std::str::FromStr>(map: &HashMap<String, String>, field: &str) -> Result<T, String>
where
    T::Err: std::fmt::Display,
{
    required(map, field)?
        .parse()
        .map_err(|e| format!("invalid {field}: {e}"))
}

fn parsed_or_default<T>(map: &HashMap<String, String>, field: &str) -> Result<T, String>
where
    T: std::str::FromStr + Default,
    T::Err: std::fmt::Display,
{
    match map.get(field).filter(|s| !s.is_empty()) {
        Some(raw) => raw.parse().map_err(|e| format!("invalid {field}: {e}")),
        None => Ok(T::default()),
    }
}

impl HashRecord for RegisteredServer {
    fn record_id(&self) -> String {
        self.id.0.clone()
    }

    fn record_address(&self) -> Option<String> {
        Some(self.address())
    }

    fn record_temp_id(&self) -> Option<String> {
        self.temp_id.clone()
    }

    fn to_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("id", self.id.0.clone()),
            ("host", self.host.clone()),
            ("port", self.port.to_string()),
            (
                "capacity",
                serde_json::to_string(&self.capacity).unwrap_or_else(|_| "{}".to_string()),
            ),
            ("status", self.status.to_string()),
            ("state", self.state.to_string()),
            ("last_heartbeat_ms", self.last_heartbeat_ms.to_string()),
        ];
        if let Some(since) = self.unavailable_since_ms {
            fields.push(("unavailable_since_ms", since.to_string()));
        }
        if let Some(temp) = &self.temp_id {
            fields.push(("temp_id", temp.clone()));
        }
        fields
    }

    fn from_fields(map: &HashMap<String, String>) -> Result<Self, String> {
        let capacity = match map.get("capacity").filter(|s| !s.is_empty()) {
            Some(raw) => serde_json::from_str(raw).map_err(|e| format!("invalid capacity: {e}"))?,
            None => HashMap::new(),
        };
        Ok(Self {
            id: ServerId::parse(required(map, "id")?).map_err(|e| e.to_string())?,
            host: required(map, "host")?.to_string(),
            port: parsed(map, "port")?,
            capacity,
            status: parsed_or_default::<EntityStatus>(map, "status")?,
            state: parsed_or_default::<RegistrationState>(map, "state")?,
            last_heartbeat_ms: parsed_or_default(map, "last_heartbeat_ms")?,
            unavailable_since_ms: map
                .get("unavailable_since_ms")
                .filter(|s| !s.is_empty())
                .map(|raw| raw.parse().map_err(|e| format!("invalid unavailable_since_ms: {e}")))
                .transpose()?,
            temp_id: map.get("temp_id").filter(|s| !s.is_empty()).cloned(),
        })
    }
}

impl HashRecord for RegisteredProxy {
    fn record_id(&self) -> String {
        self.id.0.clone()
    }

    fn record_address(&self) -> Option<String> {
        Some(self.address())
    }

    fn record_temp_id(&self) -> Option<String> {
        self.temp_id.clone()
    }

    fn to_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("id", self.id.0.clone()),
            ("host", self.host.clone()),
            ("port", self.port.to_string()),
            ("status", self.status.to_string()),
            ("state", self.state.to_string()),
            ("last_heartbeat_ms", self.last_heartbeat_ms.to_string()),
        ];
        if let Some(since) = self.unavailable_since_ms {
            fields.push(("unavailable_since_ms", since.to_string()));
        }
        if let Some(temp) = &self.temp_id {
            fields.push(("temp_id", temp.clone()));
        }
        fields
    }

    fn from_fields(map: &HashMap<String, String>) -> Result<Self, String> {
        Ok(Self {
            id: ProxyId::parse(required(map, "id")?).map_err(|e| e.to_string())?,
            host: required(map, "host")?.to_string(),
            port: parsed(map, "port")?,
            status: parsed_or_default::<EntityStatus>(map, "status")?,
            state: parsed_or_default::<RegistrationState>(map, "state")?,
            last_heartbeat_ms: parsed_or_default(map, "last_heartbeat_ms")?,
            unavailable_since_ms: map
                .get("unavailable_since_ms")
                .filter(|s| !s.is_empty())
                .map(|raw| raw.parse().map_err(|e| format!("invalid unavailable_since_ms: {e}")))
                .transpose()?,
            temp_id: map.get("temp_id").filter(|s| !s.is_empty()).cloned(),
        })
    }
}

impl HashRecord for LogicalSlot {
    fn record_id(&self) -> String {
        self.id.0.clone()
    }

    fn record_address(&self) -> Option<String> {
        None
    }

    fn record_temp_id(&self) -> Option<String> {
        None
    }

    fn to_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("id", self.id.0.clone()),
            ("server_id", self.server_id.0.clone()),
            ("family", self.family.clone()),
            ("max_players", self.max_players.to_string()),
            ("online_players", self.online_players.to_string()),
            (
                "metadata",
                serde_json::to_string(&self.metadata).unwrap_or_else(|_| "{}".to_string()),
            ),
        ];
        if let Some(variant) = &self.variant {
            fields.push(("variant", variant.clone()));
        }
        fields
    }

    fn from_fields(map: &HashMap<String, String>) -> Result<Self, String> {
        let metadata = match map.get("metadata").filter(|s| !s.is_empty()) {
            Some(raw) => serde_json::from_str(raw).map_err(|e| format!("invalid metadata: {e}"))?,
            None => HashMap::new(),
        };
        Ok(Self {
            id: SlotId::parse(required(map, "id")?).map_err(|e| e.to_string())?,
            server_id: ServerId::parse(required(map, "server_id")?).map_err(|e| e.to_string())?,
            family: required(map, "family")?.to_string(),
            variant: map.get("variant").filter(|s| !s.is_empty()).cloned(),
            max_players: parsed(map, "max_players")?,
            online_players: parsed_or_default(map, "online_players")?,
            metadata,
        })
    }
}
