//! In-memory storage backend.
//!
//! Every operation runs inside one mutex-guarded critical section, giving
//! the same atomicity contract as the Redis scripts. State dies with the
//! process; the backend exists for tests and local development.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use fulcrum_protocol::{LogicalSlot, ServerId, SlotId};
use parking_lot::Mutex;

use crate::core::{
    CapacityReservation, EntityStore, HashRecord, IdStore, SlotStore, StoreError, StoreResult,
};

// ============================================================================
// Identifier store
// ============================================================================

#[derive(Default)]
struct IdState {
    counters: HashMap<String, u32>,
    recycle: HashMap<String, BTreeSet<u32>>,
    letters: HashMap<String, BTreeSet<char>>,
}

#[derive(Default)]
pub struct MemoryIdStore {
    inner: Mutex<IdState>,
}

impl MemoryIdStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdStore for MemoryIdStore {
    async fn allocate_numeric(&self, scope: &str) -> StoreResult<u32> {
        let mut state = self.inner.lock();
        if let Some(pool) = state.recycle.get_mut(scope) {
            if let Some(&lowest) = pool.iter().next() {
                pool.remove(&lowest);
                return Ok(lowest);
            }
        }
        let counter = state.counters.entry(scope.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn release_numeric(
        &self,
        scope: &str,
        number: u32,
        purge_letters_of: Option<&str>,
    ) -> StoreResult<()> {
        let mut state = self.inner.lock();
        state
            .recycle
            .entry(scope.to_string())
            .or_default()
            .insert(number);
        if let Some(base_id) = purge_letters_of {
            state.letters.remove(base_id);
        }
        Ok(())
    }

    async fn claim_numeric(&self, scope: &str, number: u32) -> StoreResult<bool> {
        let mut state = self.inner.lock();
        let removed = state
            .recycle
            .get_mut(scope)
            .map(|pool| pool.remove(&number))
            .unwrap_or(false);
        let counter = state.counters.entry(scope.to_string()).or_insert(0);
        if number > *counter {
            *counter = number;
        }
        Ok(removed)
    }

    async fn allocate_letter(&self, base_id: &str) -> StoreResult<Option<char>> {
        let mut state = self.inner.lock();
        let pool = state.letters.entry(base_id.to_string()).or_default();
        for letter in 'A'..='Z' {
            if pool.insert(letter) {
                return Ok(Some(letter));
            }
        }
        Ok(None)
    }

    async fn release_letter(&self, base_id: &str, letter: char) -> StoreResult<bool> {
        let mut state = self.inner.lock();
        Ok(state
            .letters
            .get_mut(base_id)
            .map(|pool| pool.remove(&letter.to_ascii_uppercase()))
            .unwrap_or(false))
    }

    async fn used_letters(&self, base_id: &str) -> StoreResult<Vec<char>> {
        let state = self.inner.lock();
        Ok(state
            .letters
            .get(base_id)
            .map(|pool| pool.iter().copied().collect())
            .unwrap_or_default())
    }
}

// ============================================================================
// Entity store
// ============================================================================

struct EntityState<R> {
    active: HashMap<String, R>,
    unavailable: HashMap<String, R>,
    by_address: HashMap<String, String>,
    by_temp: HashMap<String, String>,
}

impl<R> Default for EntityState<R> {
    fn default() -> Self {
        Self {
            active: HashMap::new(),
            unavailable: HashMap::new(),
            by_address: HashMap::new(),
            by_temp: HashMap::new(),
        }
    }
}

pub struct MemoryEntityStore<R> {
    inner: Mutex<EntityState<R>>,
}

impl<R: HashRecord> MemoryEntityStore<R> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(EntityState::default()),
        }
    }

    fn index(state: &mut EntityState<R>, record: &R) {
        let id = record.record_id();
        if let Some(address) = record.record_address() {
            state.by_address.insert(address, id.clone());
        }
        if let Some(temp_id) = record.record_temp_id() {
            state.by_temp.insert(temp_id, id);
        }
    }

    fn unindex(state: &mut EntityState<R>, record: &R) {
        let id = record.record_id();
        if let Some(address) = record.record_address() {
            if state.by_address.get(&address) == Some(&id) {
                state.by_address.remove(&address);
            }
        }
        if let Some(temp_id) = record.record_temp_id() {
            if state.by_temp.get(&temp_id) == Some(&id) {
                state.by_temp.remove(&temp_id);
            }
        }
    }
}

impl<R: HashRecord> Default for MemoryEntityStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<R: HashRecord> EntityStore<R> for MemoryEntityStore<R> {
    async fn save_active(&self, record: &R) -> StoreResult<()> {
        let mut state = self.inner.lock();
        state.active.insert(record.record_id(), record.clone());
        Self::index(&mut state, record);
        Ok(())
    }

    async fn save_unavailable(&self, record: &R) -> StoreResult<()> {
        let mut state = self.inner.lock();
        state.unavailable.insert(record.record_id(), record.clone());
        Self::index(&mut state, record);
        Ok(())
    }

    async fn delete_active(&self, id: &str) -> StoreResult<bool> {
        let mut state = self.inner.lock();
        match state.active.remove(id) {
            Some(record) => {
                Self::unindex(&mut state, &record);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_unavailable(&self, id: &str) -> StoreResult<bool> {
        let mut state = self.inner.lock();
        match state.unavailable.remove(id) {
            Some(record) => {
                Self::unindex(&mut state, &record);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_active(&self, id: &str) -> StoreResult<Option<R>> {
        Ok(self.inner.lock().active.get(id).cloned())
    }

    async fn get_unavailable(&self, id: &str) -> StoreResult<Option<R>> {
        Ok(self.inner.lock().unavailable.get(id).cloned())
    }

    async fn load_active(&self) -> StoreResult<Vec<R>> {
        Ok(self.inner.lock().active.values().cloned().collect())
    }

    async fn load_unavailable(&self) -> StoreResult<Vec<R>> {
        Ok(self.inner.lock().unavailable.values().cloned().collect())
    }

    async fn id_for_address(&self, address: &str) -> StoreResult<Option<String>> {
        Ok(self.inner.lock().by_address.get(address).cloned())
    }

    async fn id_for_temp(&self, temp_id: &str) -> StoreResult<Option<String>> {
        Ok(self.inner.lock().by_temp.get(temp_id).cloned())
    }

    async fn unbind_temp(&self, temp_id: &str) -> StoreResult<()> {
        self.inner.lock().by_temp.remove(temp_id);
        Ok(())
    }
}

// ============================================================================
// Slot / capacity store
// ============================================================================

#[derive(Default)]
struct SlotState {
    /// family -> server -> remaining
    capacity: HashMap<String, HashMap<String, u32>>,
    /// family -> advertising servers
    advertisers: HashMap<String, BTreeSet<String>>,
    slots: HashMap<String, LogicalSlot>,
    player_slots: HashMap<String, String>,
    slot_players: HashMap<String, BTreeSet<String>>,
    /// player -> (token value, expiry)
    reservations: HashMap<String, (String, Instant)>,
}

#[derive(Default)]
pub struct MemorySlotStore {
    inner: Mutex<SlotState>,
}

impl MemorySlotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SlotStore for MemorySlotStore {
    async fn set_capacity(
        &self,
        server: &ServerId,
        family: &str,
        remaining: u32,
    ) -> StoreResult<()> {
        let mut state = self.inner.lock();
        state
            .capacity
            .entry(family.to_string())
            .or_default()
            .insert(server.0.clone(), remaining);
        let advertisers = state.advertisers.entry(family.to_string()).or_default();
        if remaining > 0 {
            advertisers.insert(server.0.clone());
        } else {
            advertisers.remove(&server.0);
        }
        Ok(())
    }

    async fn remaining(&self, server: &ServerId, family: &str) -> StoreResult<Option<u32>> {
        let state = self.inner.lock();
        Ok(state
            .capacity
            .get(family)
            .and_then(|counters| counters.get(&server.0))
            .copied())
    }

    async fn reserve_capacity(
        &self,
        server: &ServerId,
        family: &str,
    ) -> StoreResult<CapacityReservation> {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        let remaining = state
            .capacity
            .get_mut(family)
            .and_then(|counters| counters.get_mut(&server.0));
        match remaining {
            Some(count) if *count > 0 => {
                *count -= 1;
                let remaining = *count;
                if remaining == 0 {
                    if let Some(advertisers) = state.advertisers.get_mut(family) {
                        advertisers.remove(&server.0);
                    }
                }
                Ok(CapacityReservation::Reserved { remaining })
            }
            _ => Ok(CapacityReservation::NoCapacity),
        }
    }

    async fn release_capacity(&self, server: &ServerId, family: &str) -> StoreResult<u32> {
        let mut state = self.inner.lock();
        let count = state
            .capacity
            .entry(family.to_string())
            .or_default()
            .entry(server.0.clone())
            .or_insert(0);
        *count += 1;
        let remaining = *count;
        state
            .advertisers
            .entry(family.to_string())
            .or_default()
            .insert(server.0.clone());
        Ok(remaining)
    }

    async fn clear_capacity(&self, server: &ServerId, family: &str) -> StoreResult<()> {
        let mut state = self.inner.lock();
        if let Some(counters) = state.capacity.get_mut(family) {
            counters.remove(&server.0);
        }
        if let Some(advertisers) = state.advertisers.get_mut(family) {
            advertisers.remove(&server.0);
        }
        Ok(())
    }

    async fn advertisers(&self, family: &str) -> StoreResult<Vec<ServerId>> {
        let state = self.inner.lock();
        Ok(state
            .advertisers
            .get(family)
            .map(|servers| servers.iter().cloned().map(ServerId::from).collect())
            .unwrap_or_default())
    }

    async fn store_slot(&self, slot: &LogicalSlot) -> StoreResult<()> {
        self.inner.lock().slots.insert(slot.id.0.clone(), slot.clone());
        Ok(())
    }

    async fn load_slot(&self, id: &SlotId) -> StoreResult<Option<LogicalSlot>> {
        Ok(self.inner.lock().slots.get(&id.0).cloned())
    }

    async fn remove_slot(&self, id: &SlotId) -> StoreResult<Option<LogicalSlot>> {
        let mut state = self.inner.lock();
        state.slot_players.remove(&id.0);
        Ok(state.slots.remove(&id.0))
    }

    async fn list_slots(&self) -> StoreResult<Vec<LogicalSlot>> {
        Ok(self.inner.lock().slots.values().cloned().collect())
    }

    async fn reassign_player_slot(
        &self,
        player: &str,
        slot: &SlotId,
    ) -> StoreResult<Option<SlotId>> {
        let mut state = self.inner.lock();
        let previous = state
            .player_slots
            .insert(player.to_string(), slot.0.clone());
        state
            .slot_players
            .entry(slot.0.clone())
            .or_default()
            .insert(player.to_string());
        if let Some(previous) = &previous {
            if previous != &slot.0 {
                if let Some(members) = state.slot_players.get_mut(previous) {
                    members.remove(player);
                }
            }
        }
        Ok(previous.map(SlotId::from))
    }

    async fn player_slot(&self, player: &str) -> StoreResult<Option<SlotId>> {
        let state = self.inner.lock();
        Ok(state.player_slots.get(player).cloned().map(SlotId::from))
    }

    async fn create_reservation(
        &self,
        player: &str,
        token: &str,
        slot: &SlotId,
        ttl_ms: u64,
    ) -> StoreResult<()> {
        let mut state = self.inner.lock();
        let now = Instant::now();
        if let Some((_, expires)) = state.reservations.get(player) {
            if *expires > now {
                return Err(StoreError::ReservationLocked {
                    player: player.to_string(),
                });
            }
        }
        state.reservations.insert(
            player.to_string(),
            (
                format!("{token}:{}", slot.0),
                now + Duration::from_millis(ttl_ms),
            ),
        );
        Ok(())
    }

    async fn consume_reservation(
        &self,
        player: &str,
        token: &str,
        slot: &SlotId,
    ) -> StoreResult<()> {
        let mut state = self.inner.lock();
        let expected = format!("{token}:{}", slot.0);
        match state.reservations.get(player) {
            None => Err(StoreError::ReservationExpired {
                player: player.to_string(),
            }),
            Some((_, expires)) if *expires <= Instant::now() => {
                state.reservations.remove(player);
                Err(StoreError::ReservationExpired {
                    player: player.to_string(),
                })
            }
            Some((held, _)) if held != &expected => Err(StoreError::ReservationMismatch {
                player: player.to_string(),
                expected,
                found: held.clone(),
            }),
            Some(_) => {
                state.reservations.remove(player);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allocate_numeric_is_monotone_without_releases() {
        let ids = MemoryIdStore::new();
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(ids.allocate_numeric("servers:mini").await.unwrap());
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn released_number_is_reused_lowest_first() {
        let ids = MemoryIdStore::new();
        for _ in 0..3 {
            ids.allocate_numeric("servers:mini").await.unwrap();
        }
        ids.release_numeric("servers:mini", 2, None).await.unwrap();
        ids.release_numeric("servers:mini", 1, None).await.unwrap();
        assert_eq!(ids.allocate_numeric("servers:mini").await.unwrap(), 1);
        assert_eq!(ids.allocate_numeric("servers:mini").await.unwrap(), 2);
        assert_eq!(ids.allocate_numeric("servers:mini").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn claim_advances_counter_past_imported_number() {
        let ids = MemoryIdStore::new();
        assert!(!ids.claim_numeric("servers:mini", 7).await.unwrap());
        assert_eq!(ids.allocate_numeric("servers:mini").await.unwrap(), 8);
    }

    #[tokio::test]
    async fn letters_exhaust_at_twenty_six() {
        let ids = MemoryIdStore::new();
        for expected in 'A'..='Z' {
            assert_eq!(ids.allocate_letter("mini1").await.unwrap(), Some(expected));
        }
        assert_eq!(ids.allocate_letter("mini1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn reserve_capacity_counts_down_and_rejects_at_zero() {
        let slots = MemorySlotStore::new();
        let server = ServerId::from("mini1");
        slots.set_capacity(&server, "mini", 3).await.unwrap();

        for expected in [2u32, 1, 0] {
            assert_eq!(
                slots.reserve_capacity(&server, "mini").await.unwrap(),
                CapacityReservation::Reserved {
                    remaining: expected
                }
            );
        }
        assert_eq!(
            slots.reserve_capacity(&server, "mini").await.unwrap(),
            CapacityReservation::NoCapacity
        );
        assert_eq!(slots.release_capacity(&server, "mini").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn advertiser_set_follows_zero_boundary() {
        let slots = MemorySlotStore::new();
        let server = ServerId::from("mini1");
        slots.set_capacity(&server, "mini", 1).await.unwrap();
        assert_eq!(slots.advertisers("mini").await.unwrap().len(), 1);

        slots.reserve_capacity(&server, "mini").await.unwrap();
        assert!(slots.advertisers("mini").await.unwrap().is_empty());

        slots.release_capacity(&server, "mini").await.unwrap();
        assert_eq!(slots.advertisers("mini").await.unwrap(), vec![server]);
    }

    #[tokio::test]
    async fn concurrent_reservations_grant_exactly_one_winner() {
        use std::sync::Arc;

        let slots = Arc::new(MemorySlotStore::new());
        let server = ServerId::from("mini1");
        slots.set_capacity(&server, "mini", 1).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let slots = Arc::clone(&slots);
            let server = server.clone();
            handles.push(tokio::spawn(async move {
                slots.reserve_capacity(&server, "mini").await.unwrap()
            }));
        }

        let mut wins = 0;
        for handle in handles {
            if let CapacityReservation::Reserved { .. } = handle.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1, "only one concurrent caller may win the last unit");
    }

    #[tokio::test]
    async fn reassign_returns_previous_slot() {
        let slots = MemorySlotStore::new();
        let first = SlotId::from("mini1A");
        let second = SlotId::from("mini2B");

        assert_eq!(
            slots.reassign_player_slot("Notch", &first).await.unwrap(),
            None
        );
        assert_eq!(
            slots.reassign_player_slot("Notch", &second).await.unwrap(),
            Some(first)
        );
    }

    #[tokio::test]
    async fn reservation_tokens_validate_and_consume_once() {
        let slots = MemorySlotStore::new();
        let slot = SlotId::from("mini1A");

        slots
            .create_reservation("Notch", "tok-1", &slot, 60_000)
            .await
            .unwrap();

        // Second create while held is rejected.
        let locked = slots
            .create_reservation("Notch", "tok-2", &slot, 60_000)
            .await;
        assert!(matches!(locked, Err(StoreError::ReservationLocked { .. })));

        // Wrong token is a mismatch; the right one consumes.
        let mismatch = slots.consume_reservation("Notch", "tok-9", &slot).await;
        assert!(matches!(
            mismatch,
            Err(StoreError::ReservationMismatch { .. })
        ));
        slots
            .consume_reservation("Notch", "tok-1", &slot)
            .await
            .unwrap();

        // Consumed means gone.
        let expired = slots.consume_reservation("Notch", "tok-1", &slot).await;
        assert!(matches!(expired, Err(StoreError::ReservationExpired { .. })));
    }
}
