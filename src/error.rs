//! Registry error types.

use fulcrum_protocol::{IdParseError, RegistrationState, ServerId};
use registry_store::StoreError;

/// Result alias for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// All 26 slot letters are in use for a base id. Fatal for this
    /// allocation attempt; the caller must pick another base server.
    #[error("slot limit exceeded for {base_id}: all 26 letters in use")]
    SlotLimitExceeded { base_id: ServerId },

    /// No remaining units for a family on a server. Non-fatal; the caller
    /// requeues or tries another server.
    #[error("no capacity remaining for family {family} on {server_id}")]
    CapacityExhausted { server_id: ServerId, family: String },

    #[error("illegal transition for {entity}: {from} -> {to}")]
    IllegalTransition {
        entity: String,
        from: RegistrationState,
        to: RegistrationState,
    },

    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    #[error("invalid registration: {0}")]
    InvalidRegistration(String),

    #[error("address {address} already registered as {id}")]
    AlreadyRegistered { address: String, id: String },

    /// Entity still holds an active registration; pass `force` to release
    /// it anyway.
    #[error("entity {0} is still active; release requires force")]
    StillActive(String),

    #[error("identifier error: {0}")]
    Id(#[from] IdParseError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RegistryError {
    /// Whether retrying against the store can succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_retriable())
    }
}
