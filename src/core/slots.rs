//! Per-family capacity accounting and logical slot management.
//!
//! Counters live in the store and every reserve/release is one atomic
//! store operation; this manager composes them with slot metadata and
//! reports the advertiser-set boundary crossings the service publishes as
//! capacity-changed events.

use std::collections::HashMap;
use std::sync::Arc;

use fulcrum_protocol::{LogicalSlot, RegisteredServer, ServerId, SlotId};
use registry_store::{CapacityReservation, SlotStore};
use tracing::{debug, info};

use crate::core::IdAllocator;
use crate::error::{RegistryError, RegistryResult};

/// A counter movement the rest of the fleet should hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityChange {
    pub server_id: ServerId,
    pub family: String,
    pub remaining: u32,
    pub advertising: bool,
}

pub struct SlotManager {
    slots: Arc<dyn SlotStore>,
    allocator: Arc<IdAllocator>,
}

impl SlotManager {
    pub fn new(slots: Arc<dyn SlotStore>, allocator: Arc<IdAllocator>) -> Self {
        Self { slots, allocator }
    }

    pub fn store(&self) -> &Arc<dyn SlotStore> {
        &self.slots
    }

    /// Seed family counters from a server's declared capacity and open one
    /// logical slot per family. Returns the created slots.
    pub async fn register_server(
        &self,
        server: &RegisteredServer,
    ) -> RegistryResult<Vec<LogicalSlot>> {
        let mut created = Vec::with_capacity(server.capacity.len());
        for (family, declared) in &server.capacity {
            self.slots
                .set_capacity(&server.id, family, *declared)
                .await?;
            let slot = self
                .open_slot(&server.id, family, None, *declared, HashMap::new())
                .await?;
            created.push(slot);
        }
        info!(id = %server.id, families = server.capacity.len(), "Seeded capacity");
        Ok(created)
    }

    /// Withdraw a server from every family it advertises and drop its slot
    /// records. Used when an entity is parked or released.
    pub async fn withdraw_server(&self, server: &RegisteredServer) -> RegistryResult<Vec<SlotId>> {
        for family in server.capacity.keys() {
            self.slots.clear_capacity(&server.id, family).await?;
        }
        let mut removed = Vec::new();
        for slot in self.slots.list_slots().await? {
            if slot.server_id == server.id {
                self.slots.remove_slot(&slot.id).await?;
                self.allocator.release_slot_id(&slot.id).await?;
                removed.push(slot.id);
            }
        }
        info!(id = %server.id, slots = removed.len(), "Withdrew server capacity");
        Ok(removed)
    }

    /// Allocate a slot letter and persist the slot record.
    pub async fn open_slot(
        &self,
        server_id: &ServerId,
        family: &str,
        variant: Option<String>,
        max_players: u32,
        metadata: HashMap<String, String>,
    ) -> RegistryResult<LogicalSlot> {
        let id = self.allocator.allocate_slot_id(server_id).await?;
        let slot = LogicalSlot {
            id,
            server_id: server_id.clone(),
            family: family.to_string(),
            variant,
            max_players,
            online_players: 0,
            metadata,
        };
        self.slots.store_slot(&slot).await?;
        debug!(id = %slot.id, family, "Opened logical slot");
        Ok(slot)
    }

    /// Persist an externally announced slot (e.g. a game server spinning up
    /// an extra instance).
    pub async fn store_slot(&self, slot: &LogicalSlot) -> RegistryResult<()> {
        Ok(self.slots.store_slot(slot).await?)
    }

    /// Remove a slot record, freeing its letter and settling the family
    /// capacity bookkeeping it contributed.
    pub async fn remove_slot(&self, id: &SlotId) -> RegistryResult<Option<CapacityChange>> {
        let Some(slot) = self.slots.remove_slot(id).await? else {
            return Ok(None);
        };
        self.allocator.release_slot_id(id).await?;
        self.slots
            .clear_capacity(&slot.server_id, &slot.family)
            .await?;
        info!(%id, family = %slot.family, "Removed logical slot");
        Ok(Some(CapacityChange {
            server_id: slot.server_id,
            family: slot.family,
            remaining: 0,
            advertising: false,
        }))
    }

    /// Atomically consume one unit of `family` capacity on `server_id`.
    /// Returns the change to publish, or a typed capacity-exhausted error
    /// that callers treat as non-fatal.
    pub async fn reserve(&self, server_id: &ServerId, family: &str) -> RegistryResult<CapacityChange> {
        match self.slots.reserve_capacity(server_id, family).await? {
            CapacityReservation::Reserved { remaining } => Ok(CapacityChange {
                server_id: server_id.clone(),
                family: family.to_string(),
                remaining,
                advertising: remaining > 0,
            }),
            CapacityReservation::NoCapacity => Err(RegistryError::CapacityExhausted {
                server_id: server_id.clone(),
                family: family.to_string(),
            }),
        }
    }

    /// Atomically return one unit of capacity.
    pub async fn release(&self, server_id: &ServerId, family: &str) -> RegistryResult<CapacityChange> {
        let remaining = self.slots.release_capacity(server_id, family).await?;
        Ok(CapacityChange {
            server_id: server_id.clone(),
            family: family.to_string(),
            remaining,
            advertising: remaining > 0,
        })
    }

    pub async fn slots_for_family(&self, family: &str) -> RegistryResult<Vec<LogicalSlot>> {
        let slots = self.slots.list_slots().await?;
        Ok(slots.into_iter().filter(|s| s.family == family).collect())
    }
}
