// core.rs
//
// Core types for the registry store.
// Contains all traits, error types, and the record field-map contract
// shared by every storage backend.
//
// Structure:
// 1. Errors
// 2. Record field-map contract
// 3. Identifier store trait
// 4. Entity store trait
// 5. Slot/capacity store trait

use std::collections::HashMap;

use async_trait::async_trait;
use fulcrum_protocol::{LogicalSlot, ServerId, SlotId};

// ============================================================================
// PART 1: Errors
// ============================================================================

/// Result alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Pool error: {0}")]
    Pool(String),

    #[error("Script error: {0}")]
    Script(String),

    /// An individual persisted record failed to deserialize. Loads log and
    /// skip these; they never abort a partition scan.
    #[error("Corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Reservation for {player} is already held")]
    ReservationLocked { player: String },

    #[error("Reservation for {player} has expired")]
    ReservationExpired { player: String },

    #[error("Reservation mismatch for {player}: expected {expected}, found {found}")]
    ReservationMismatch {
        player: String,
        expected: String,
        found: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether retrying the operation against the store can succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Pool(_))
    }
}

// ============================================================================
// PART 2: Record field-map contract
// ============================================================================

/// Explicit field-level (de)serialization for persisted records.
///
/// Records are stored as flat string maps. Unknown fields in a stored map
/// are ignored and missing optional fields default, so old and new builds
/// can read each other's records.
pub trait HashRecord: Clone + Send + Sync + 'static {
    /// Key component identifying this record inside its partition.
    fn record_id(&self) -> String;

    /// Network address for the reverse index, when the record has one.
    fn record_address(&self) -> Option<String>;

    /// Bootstrap-phase identifier for the temp-id index, when present.
    fn record_temp_id(&self) -> Option<String>;

    fn to_fields(&self) -> Vec<(&'static str, String)>;

    fn from_fields(map: &HashMap<String, String>) -> Result<Self, String>;
}

// ============================================================================
// PART 3: Identifier store
// ============================================================================

/// Persistent counters, recycle pools, and slot-letter pools.
///
/// Every operation is a single atomic unit against the store; concurrent
/// callers from separate processes never observe partial mutations.
#[async_trait]
pub trait IdStore: Send + Sync + 'static {
    /// Pop the lowest recycled number for `scope`, or advance the counter.
    async fn allocate_numeric(&self, scope: &str) -> StoreResult<u32>;

    /// Return `number` to the recycle pool. When `purge_letters_of` names a
    /// base id, its slot-letter pool is dropped in the same atomic unit
    /// (cascading release of a base server id).
    async fn release_numeric(
        &self,
        scope: &str,
        number: u32,
        purge_letters_of: Option<&str>,
    ) -> StoreResult<()>;

    /// Remove `number` from the recycle pool without allocating, advancing
    /// the counter past it if needed. Returns whether the pool held it.
    async fn claim_numeric(&self, scope: &str, number: u32) -> StoreResult<bool>;

    /// Reserve the lowest unused letter `A`..`Z` for `base_id`. `None` once
    /// all 26 are in use.
    async fn allocate_letter(&self, base_id: &str) -> StoreResult<Option<char>>;

    /// Free one letter. Returns whether it was allocated.
    async fn release_letter(&self, base_id: &str, letter: char) -> StoreResult<bool>;

    async fn used_letters(&self, base_id: &str) -> StoreResult<Vec<char>>;
}

// ============================================================================
// PART 4: Entity store
// ============================================================================

/// Durable state for registered entities, partitioned into active and
/// unavailable sets with address and temp-id reverse indexes.
#[async_trait]
pub trait EntityStore<R: HashRecord>: Send + Sync + 'static {
    async fn save_active(&self, record: &R) -> StoreResult<()>;

    async fn save_unavailable(&self, record: &R) -> StoreResult<()>;

    /// Remove from the active partition. Returns whether a record existed.
    async fn delete_active(&self, id: &str) -> StoreResult<bool>;

    async fn delete_unavailable(&self, id: &str) -> StoreResult<bool>;

    async fn get_active(&self, id: &str) -> StoreResult<Option<R>>;

    async fn get_unavailable(&self, id: &str) -> StoreResult<Option<R>>;

    /// Load every record in the active partition. Corrupt records are
    /// logged and skipped.
    async fn load_active(&self) -> StoreResult<Vec<R>>;

    async fn load_unavailable(&self) -> StoreResult<Vec<R>>;

    async fn id_for_address(&self, address: &str) -> StoreResult<Option<String>>;

    async fn id_for_temp(&self, temp_id: &str) -> StoreResult<Option<String>>;

    async fn unbind_temp(&self, temp_id: &str) -> StoreResult<()>;
}

// ============================================================================
// PART 5: Slot / capacity store
// ============================================================================

/// Result of an atomic capacity reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityReservation {
    /// One unit was consumed; `remaining` is the post-decrement count.
    Reserved { remaining: u32 },
    /// Counter was absent or zero; nothing was mutated.
    NoCapacity,
}

/// Atomic per-(server, family) capacity accounting plus logical slot
/// metadata and the player→slot assignment map.
#[async_trait]
pub trait SlotStore: Send + Sync + 'static {
    /// Seed or overwrite the remaining counter, updating the advertiser set
    /// to match.
    async fn set_capacity(&self, server: &ServerId, family: &str, remaining: u32)
        -> StoreResult<()>;

    async fn remaining(&self, server: &ServerId, family: &str) -> StoreResult<Option<u32>>;

    /// Atomically consume one unit. Never drives the counter negative; a
    /// decrement to zero removes the server from the advertiser set in the
    /// same unit.
    async fn reserve_capacity(
        &self,
        server: &ServerId,
        family: &str,
    ) -> StoreResult<CapacityReservation>;

    /// Atomically return one unit, re-adding the server to the advertiser
    /// set when the counter becomes positive.
    async fn release_capacity(&self, server: &ServerId, family: &str) -> StoreResult<u32>;

    /// Drop the counter and advertiser membership entirely (entity leaving
    /// the fleet).
    async fn clear_capacity(&self, server: &ServerId, family: &str) -> StoreResult<()>;

    /// Servers currently advertising free capacity for `family`.
    async fn advertisers(&self, family: &str) -> StoreResult<Vec<ServerId>>;

    async fn store_slot(&self, slot: &LogicalSlot) -> StoreResult<()>;

    async fn load_slot(&self, id: &SlotId) -> StoreResult<Option<LogicalSlot>>;

    /// Delete the slot record, returning it so callers can settle the
    /// family-capacity bookkeeping it contributed.
    async fn remove_slot(&self, id: &SlotId) -> StoreResult<Option<LogicalSlot>>;

    async fn list_slots(&self) -> StoreResult<Vec<LogicalSlot>>;

    /// Atomically point `player` at `slot`, returning the previous slot if
    /// one was assigned.
    async fn reassign_player_slot(&self, player: &str, slot: &SlotId)
        -> StoreResult<Option<SlotId>>;

    /// Slot the player is currently assigned to, if any.
    async fn player_slot(&self, player: &str) -> StoreResult<Option<SlotId>>;

    /// Record a short-lived reservation token for a routed player.
    /// Fails with [`StoreError::ReservationLocked`] while one is held.
    async fn create_reservation(
        &self,
        player: &str,
        token: &str,
        slot: &SlotId,
        ttl_ms: u64,
    ) -> StoreResult<()>;

    /// Validate and consume a reservation token. The token is deleted on
    /// success; expiry and mismatch surface as typed errors.
    async fn consume_reservation(
        &self,
        player: &str,
        token: &str,
        slot: &SlotId,
    ) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_errors_are_retriable() {
        assert!(StoreError::Connection("timeout".into()).is_retriable());
        assert!(StoreError::Pool("exhausted".into()).is_retriable());
    }

    #[test]
    fn reservation_errors_are_not_retriable() {
        let err = StoreError::ReservationExpired {
            player: "Notch".into(),
        };
        assert!(!err.is_retriable());
        assert!(err.to_string().contains("Notch"));
    }
}
