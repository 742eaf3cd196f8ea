//! Durable registries for servers and proxies.
//!
//! A registry owns a write-through cache over one entity partition pair
//! (active / unavailable). The store is authoritative; the cache exists so
//! heartbeat scans and lookups do not hammer the store, and it is rebuilt
//! from the store on startup with persisted lifecycle states restored
//! verbatim.

use std::sync::Arc;

use dashmap::DashMap;
use fulcrum_protocol::{EntityStatus, RegisteredProxy, RegisteredServer, RegistrationState};
use registry_store::{EntityStore, HashRecord};
use tracing::{info, warn};

use crate::core::state;
use crate::error::{RegistryError, RegistryResult};

/// Registry-visible accessors every fleet record exposes.
pub trait FleetRecord: HashRecord {
    fn state(&self) -> RegistrationState;
    fn set_state(&mut self, state: RegistrationState);
    fn status(&self) -> EntityStatus;
    fn set_status(&mut self, status: EntityStatus);
    fn heartbeat_ms(&self) -> u64;
    fn set_heartbeat_ms(&mut self, now_ms: u64);
    fn unavailable_since_ms(&self) -> Option<u64>;
    fn set_unavailable_since_ms(&mut self, since: Option<u64>);
}

macro_rules! impl_fleet_record {
    ($record:ty) => {
        impl FleetRecord for $record {
            fn state(&self) -> RegistrationState {
                self.state
            }
            fn set_state(&mut self, state: RegistrationState) {
                self.state = state;
            }
            fn status(&self) -> EntityStatus {
                self.status
            }
            fn set_status(&mut self, status: EntityStatus) {
                self.status = status;
            }
            fn heartbeat_ms(&self) -> u64 {
                self.last_heartbeat_ms
            }
            fn set_heartbeat_ms(&mut self, now_ms: u64) {
                self.last_heartbeat_ms = now_ms;
            }
            fn unavailable_since_ms(&self) -> Option<u64> {
                self.unavailable_since_ms
            }
            fn set_unavailable_since_ms(&mut self, since: Option<u64>) {
                self.unavailable_since_ms = since;
            }
        }
    };
}

impl_fleet_record!(RegisteredServer);
impl_fleet_record!(RegisteredProxy);

/// What a heartbeat did to the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEffect {
    /// First heartbeat after registration; the entity went active.
    FirstActivation,
    /// The entity returned from the unavailable partition.
    Recovered,
    /// Routine refresh of an already-active entity.
    Refreshed,
}

pub struct FleetRegistry<R: FleetRecord> {
    store: Arc<dyn EntityStore<R>>,
    cache: DashMap<String, R>,
}

pub type ServerRegistry = FleetRegistry<RegisteredServer>;
pub type ProxyRegistry = FleetRegistry<RegisteredProxy>;

impl<R: FleetRecord> FleetRegistry<R> {
    pub fn new(store: Arc<dyn EntityStore<R>>) -> Self {
        Self {
            store,
            cache: DashMap::new(),
        }
    }

    /// Rebuild the cache from both partitions. Persisted lifecycle states
    /// are restored as-is rather than re-deriving transitions; corrupt
    /// records were already skipped by the store.
    pub async fn restore(&self) -> RegistryResult<(usize, usize)> {
        let active = self.store.load_active().await?;
        let unavailable = self.store.load_unavailable().await?;
        let counts = (active.len(), unavailable.len());
        for record in active.into_iter().chain(unavailable) {
            self.cache.insert(record.record_id(), record);
        }
        Ok(counts)
    }

    /// Persist a freshly registered entity into the active partition.
    pub async fn insert_active(&self, record: R) -> RegistryResult<()> {
        self.store.save_active(&record).await?;
        self.cache.insert(record.record_id(), record);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<R> {
        self.cache.get(id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Snapshot of every cached record.
    pub fn all(&self) -> Vec<R> {
        self.cache.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Apply a heartbeat: refreshes the timestamp and, when the entity was
    /// pending or parked, moves it back to active with a validated state
    /// transition and partition move.
    pub async fn heartbeat(&self, id: &str, now_ms: u64) -> RegistryResult<(R, HeartbeatEffect)> {
        let mut record = self
            .get(id)
            .ok_or_else(|| RegistryError::UnknownEntity(id.to_string()))?;

        let effect = match record.state() {
            RegistrationState::Pending => {
                let mut next = record.state();
                state::apply(id, &mut next, RegistrationState::Active)?;
                record.set_state(next);
                HeartbeatEffect::FirstActivation
            }
            RegistrationState::Unavailable => {
                let mut next = record.state();
                state::apply(id, &mut next, RegistrationState::Active)?;
                record.set_state(next);
                HeartbeatEffect::Recovered
            }
            RegistrationState::Active => HeartbeatEffect::Refreshed,
            RegistrationState::Released => {
                // A released id heartbeating again is a zombie process.
                warn!(%id, "Dropping heartbeat from released entity");
                return Err(RegistryError::UnknownEntity(id.to_string()));
            }
        };

        record.set_heartbeat_ms(now_ms);
        if effect == HeartbeatEffect::Recovered {
            record.set_unavailable_since_ms(None);
            record.set_status(EntityStatus::Active);
            self.store.delete_unavailable(id).await?;
        }
        self.store.save_active(&record).await?;
        self.cache.insert(record.record_id(), record.clone());
        Ok((record, effect))
    }

    /// Park an entity that failed heartbeat checks. It is retained in the
    /// unavailable partition for the operator-controlled reclaim window.
    pub async fn mark_unavailable(&self, id: &str, now_ms: u64) -> RegistryResult<R> {
        let mut record = self
            .get(id)
            .ok_or_else(|| RegistryError::UnknownEntity(id.to_string()))?;

        let mut next = record.state();
        state::apply(id, &mut next, RegistrationState::Unavailable)?;
        record.set_state(next);
        record.set_status(EntityStatus::Unavailable);
        record.set_unavailable_since_ms(Some(now_ms));

        self.store.delete_active(id).await?;
        self.store.save_unavailable(&record).await?;
        self.cache.insert(record.record_id(), record.clone());
        info!(%id, "Entity parked as unavailable");
        Ok(record)
    }

    /// Remove an entity from both partitions, returning the final record.
    pub async fn release(&self, id: &str) -> RegistryResult<R> {
        let mut record = self
            .get(id)
            .ok_or_else(|| RegistryError::UnknownEntity(id.to_string()))?;

        let mut next = record.state();
        state::apply(id, &mut next, RegistrationState::Released)?;
        record.set_state(next);

        self.store.delete_active(id).await?;
        self.store.delete_unavailable(id).await?;
        self.cache.remove(id);
        info!(%id, "Entity released");
        Ok(record)
    }

    /// Active entities whose last heartbeat predates `cutoff_ms`.
    pub fn stale(&self, cutoff_ms: u64) -> Vec<R> {
        self.cache
            .iter()
            .filter(|entry| {
                matches!(
                    entry.value().state(),
                    RegistrationState::Active | RegistrationState::Pending
                ) && entry.value().heartbeat_ms() < cutoff_ms
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Unavailable entities parked since before `cutoff_ms`.
    pub fn reclaimable(&self, cutoff_ms: u64) -> Vec<R> {
        self.cache
            .iter()
            .filter(|entry| {
                entry.value().state() == RegistrationState::Unavailable
                    && entry
                        .value()
                        .unavailable_since_ms()
                        .is_some_and(|since| since < cutoff_ms)
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub async fn id_for_address(&self, address: &str) -> RegistryResult<Option<String>> {
        Ok(self.store.id_for_address(address).await?)
    }

    pub async fn id_for_temp(&self, temp_id: &str) -> RegistryResult<Option<String>> {
        Ok(self.store.id_for_temp(temp_id).await?)
    }

    pub async fn unbind_temp(&self, temp_id: &str) -> RegistryResult<()> {
        Ok(self.store.unbind_temp(temp_id).await?)
    }
}
