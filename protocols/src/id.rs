//! Canonical fleet identifiers.
//!
//! This module defines the single source of truth for server, proxy, and
//! slot identity. These types are shared across bus message boundaries and
//! internal runtime state.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Fixed prefix for proxy identifiers.
pub const PROXY_ID_PREFIX: &str = "fulcrum-proxy-";

/// Maximum number of concurrent slot letters per base server.
pub const MAX_SLOT_LETTERS: usize = 26;

/// Error produced when parsing an identifier from the wire.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdParseError {
    #[error("invalid server id '{0}': expected <family><number>")]
    InvalidServerId(String),

    #[error("invalid slot id '{0}': expected <family><number><letter A-Z>")]
    InvalidSlotId(String),

    #[error("invalid proxy id '{0}': expected {PROXY_ID_PREFIX}<number>")]
    InvalidProxyId(String),
}

/// Identifier of a base backend server, `{family}{number}` (e.g. `mini1`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct ServerId(pub String);

impl ServerId {
    pub fn new(family: &str, number: u32) -> Self {
        Self(format!("{family}{number}"))
    }

    /// Parse and validate: a non-empty alphabetic family followed by digits.
    pub fn parse(raw: &str) -> Result<Self, IdParseError> {
        let split = split_trailing_digits(raw);
        match split {
            Some((family, _)) if !family.is_empty() => Ok(Self(raw.to_string())),
            _ => Err(IdParseError::InvalidServerId(raw.to_string())),
        }
    }

    /// The family prefix (`mini` for `mini1`).
    pub fn family(&self) -> &str {
        split_trailing_digits(&self.0)
            .map(|(family, _)| family)
            .unwrap_or(&self.0)
    }

    /// The numeric suffix (`1` for `mini1`).
    pub fn number(&self) -> Option<u32> {
        split_trailing_digits(&self.0).and_then(|(_, digits)| digits.parse().ok())
    }
}

impl Display for ServerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ServerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ServerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifier of a logical slot: a server id plus one uppercase letter
/// suffix (`mini1A`). At most [`MAX_SLOT_LETTERS`] letters exist per base id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct SlotId(pub String);

impl SlotId {
    pub fn new(server: &ServerId, letter: char) -> Self {
        Self(format!("{}{}", server.0, letter.to_ascii_uppercase()))
    }

    pub fn parse(raw: &str) -> Result<Self, IdParseError> {
        let mut chars = raw.chars();
        match chars.next_back() {
            Some(c) if c.is_ascii_uppercase() => {
                ServerId::parse(chars.as_str())
                    .map_err(|_| IdParseError::InvalidSlotId(raw.to_string()))?;
                Ok(Self(raw.to_string()))
            }
            _ => Err(IdParseError::InvalidSlotId(raw.to_string())),
        }
    }

    /// The base server id (`mini1` for `mini1A`).
    pub fn server_id(&self) -> ServerId {
        let trimmed = self
            .0
            .strip_suffix(|c: char| c.is_ascii_uppercase())
            .unwrap_or(&self.0);
        ServerId(trimmed.to_string())
    }

    /// The letter suffix (`A` for `mini1A`).
    pub fn letter(&self) -> Option<char> {
        self.0.chars().next_back().filter(char::is_ascii_uppercase)
    }

    /// Case-insensitive identifier comparison. Slot ids arriving from chat
    /// commands and kick events differ in casing; routing decisions must not.
    pub fn matches(&self, other: &SlotId) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Display for SlotId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SlotId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SlotId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifier of a proxy process, `fulcrum-proxy-{number}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct ProxyId(pub String);

impl ProxyId {
    pub fn new(number: u32) -> Self {
        Self(format!("{PROXY_ID_PREFIX}{number}"))
    }

    pub fn parse(raw: &str) -> Result<Self, IdParseError> {
        match raw.strip_prefix(PROXY_ID_PREFIX) {
            Some(digits) if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) => {
                Ok(Self(raw.to_string()))
            }
            _ => Err(IdParseError::InvalidProxyId(raw.to_string())),
        }
    }

    pub fn number(&self) -> Option<u32> {
        self.0
            .strip_prefix(PROXY_ID_PREFIX)
            .and_then(|digits| digits.parse().ok())
    }
}

impl Display for ProxyId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ProxyId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ProxyId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Either side of the fleet: a backend server or a proxy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum EntityId {
    Server(ServerId),
    Proxy(ProxyId),
}

impl Display for EntityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityId::Server(id) => Display::fmt(id, f),
            EntityId::Proxy(id) => Display::fmt(id, f),
        }
    }
}

impl From<ServerId> for EntityId {
    fn from(value: ServerId) -> Self {
        Self::Server(value)
    }
}

impl From<ProxyId> for EntityId {
    fn from(value: ProxyId) -> Self {
        Self::Proxy(value)
    }
}

/// Split `mini12` into `("mini", "12")`. Returns `None` when the string has
/// no trailing digits.
fn split_trailing_digits(raw: &str) -> Option<(&str, &str)> {
    let digits_at = raw.rfind(|c: char| !c.is_ascii_digit()).map(|i| i + 1)?;
    if digits_at >= raw.len() {
        return None;
    }
    let (prefix, digits) = raw.split_at(digits_at);
    if prefix.chars().all(|c| c.is_ascii_alphabetic() || c == '-' || c == '_') {
        Some((prefix, digits))
    } else {
        None
    }
}
