//! Redis storage implementation using RedisStore helper
//!
//! Structure:
//! 1. RedisStore helper and key namespace
//! 2. RedisIdStore
//! 3. RedisEntityStore
//! 4. RedisSlotStore

use std::collections::HashMap;
use std::marker::PhantomData;

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use fulcrum_protocol::{LogicalSlot, ServerId, SlotId};
use redis::AsyncCommands;
use tracing::warn;

use crate::config::RedisConfig;
use crate::core::{
    CapacityReservation, EntityStore, HashRecord, IdStore, SlotStore, StoreError, StoreResult,
};
use crate::scripts;

/// Partition a [`RedisEntityStore`] operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Servers,
    Proxies,
}

impl EntityKind {
    fn as_str(self) -> &'static str {
        match self {
            EntityKind::Servers => "servers",
            EntityKind::Proxies => "proxies",
        }
    }
}

pub(crate) struct RedisStore {
    pool: Pool,
    prefix: String,
}

impl RedisStore {
    pub fn new(config: RedisConfig) -> Result<Self, String> {
        let mut cfg = Config::from_url(config.url);
        cfg.pool = Some(deadpool_redis::PoolConfig::new(config.pool_max));
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| e.to_string())?;
        Ok(Self {
            pool,
            prefix: config.key_prefix,
        })
    }

    async fn conn(&self) -> StoreResult<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
    }

    // -- key namespace ------------------------------------------------------

    fn partition_key(&self, kind: EntityKind, status: &str) -> String {
        format!("{}:{}:{status}", self.prefix, kind.as_str())
    }

    fn record_key(&self, kind: EntityKind, status: &str, id: &str) -> String {
        format!("{}:{}:{status}:{id}", self.prefix, kind.as_str())
    }

    fn address_index_key(&self, kind: EntityKind, address: &str) -> String {
        format!("{}:index:address:{}:{address}", self.prefix, kind.as_str())
    }

    fn temp_index_key(&self, kind: EntityKind, temp_id: &str) -> String {
        format!("{}:index:temp:{}:{temp_id}", self.prefix, kind.as_str())
    }

    fn counter_key(&self, scope: &str) -> String {
        format!("{}:ids:counter:{scope}", self.prefix)
    }

    fn recycle_key(&self, scope: &str) -> String {
        format!("{}:ids:recycle:{scope}", self.prefix)
    }

    fn letters_key(&self, base_id: &str) -> String {
        format!("{}:ids:letters:{base_id}", self.prefix)
    }

    fn capacity_key(&self, family: &str) -> String {
        format!("{}:capacity:{family}", self.prefix)
    }

    fn advertisers_key(&self, family: &str) -> String {
        format!("{}:capacity:advertisers:{family}", self.prefix)
    }

    fn slots_set_key(&self) -> String {
        format!("{}:slots", self.prefix)
    }

    fn slot_key(&self, slot_id: &str) -> String {
        format!("{}:slots:{slot_id}", self.prefix)
    }

    fn player_slot_key(&self) -> String {
        format!("{}:players:slot", self.prefix)
    }

    fn slot_players_prefix(&self) -> String {
        format!("{}:slots:players:", self.prefix)
    }

    fn reservation_key(&self, player: &str) -> String {
        format!("{}:reservations:{player}", self.prefix)
    }
}

impl Clone for RedisStore {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            prefix: self.prefix.clone(),
        }
    }
}

fn script_err(e: redis::RedisError) -> StoreError {
    StoreError::Script(e.to_string())
}

fn conn_err(e: redis::RedisError) -> StoreError {
    StoreError::Connection(e.to_string())
}

// ============================================================================
// PART 2: Identifier store
// ============================================================================

pub struct RedisIdStore {
    store: RedisStore,
}

impl RedisIdStore {
    pub(crate) fn new(store: RedisStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl IdStore for RedisIdStore {
    async fn allocate_numeric(&self, scope: &str) -> StoreResult<u32> {
        let mut conn = self.store.conn().await?;
        let number: u32 = scripts::ALLOCATE_OR_RECYCLE
            .key(self.store.recycle_key(scope))
            .key(self.store.counter_key(scope))
            .invoke_async(&mut conn)
            .await
            .map_err(script_err)?;
        Ok(number)
    }

    async fn release_numeric(
        &self,
        scope: &str,
        number: u32,
        purge_letters_of: Option<&str>,
    ) -> StoreResult<()> {
        let mut conn = self.store.conn().await?;
        // The letter pool of a bare release still needs a key operand; a
        // blank base id maps to a key that is never written.
        let letters_key = self.store.letters_key(purge_letters_of.unwrap_or(""));
        let _: i64 = scripts::RELEASE_NUMBER
            .key(self.store.recycle_key(scope))
            .key(letters_key)
            .arg(number)
            .invoke_async(&mut conn)
            .await
            .map_err(script_err)?;
        Ok(())
    }

    async fn claim_numeric(&self, scope: &str, number: u32) -> StoreResult<bool> {
        let mut conn = self.store.conn().await?;
        let removed: i64 = scripts::CLAIM_NUMBER
            .key(self.store.recycle_key(scope))
            .key(self.store.counter_key(scope))
            .arg(number)
            .invoke_async(&mut conn)
            .await
            .map_err(script_err)?;
        Ok(removed > 0)
    }

    async fn allocate_letter(&self, base_id: &str) -> StoreResult<Option<char>> {
        let mut conn = self.store.conn().await?;
        let letter: Option<String> = scripts::ALLOCATE_LETTER
            .key(self.store.letters_key(base_id))
            .invoke_async(&mut conn)
            .await
            .map_err(script_err)?;
        Ok(letter.and_then(|s| s.chars().next()))
    }

    async fn release_letter(&self, base_id: &str, letter: char) -> StoreResult<bool> {
        let mut conn = self.store.conn().await?;
        let removed: i64 = conn
            .srem(self.store.letters_key(base_id), letter.to_string())
            .await
            .map_err(conn_err)?;
        Ok(removed > 0)
    }

    async fn used_letters(&self, base_id: &str) -> StoreResult<Vec<char>> {
        let mut conn = self.store.conn().await?;
        let members: Vec<String> = conn
            .smembers(self.store.letters_key(base_id))
            .await
            .map_err(conn_err)?;
        let mut letters: Vec<char> = members.iter().filter_map(|s| s.chars().next()).collect();
        letters.sort_unstable();
        Ok(letters)
    }
}

// ============================================================================
// PART 3: Entity store
// ============================================================================

pub struct RedisEntityStore<R> {
    store: RedisStore,
    kind: EntityKind,
    _record: PhantomData<fn() -> R>,
}

impl<R: HashRecord> RedisEntityStore<R> {
    pub(crate) fn new(store: RedisStore, kind: EntityKind) -> Self {
        Self {
            store,
            kind,
            _record: PhantomData,
        }
    }

    /// Write the record hash and its indexes in one MULTI/EXEC so a
    /// concurrent reader never observes a half-written record.
    async fn save(&self, record: &R, status: &str) -> StoreResult<()> {
        let id = record.record_id();
        let key = self.store.record_key(self.kind, status, &id);
        let partition = self.store.partition_key(self.kind, status);

        let mut conn = self.store.conn().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        // Replace the hash wholesale so stale optional fields cannot linger.
        pipe.del(&key);
        for (field, value) in record.to_fields() {
            pipe.hset(&key, field, value);
        }
        pipe.sadd(&partition, &id);
        if let Some(address) = record.record_address() {
            pipe.set(self.store.address_index_key(self.kind, &address), &id);
        }
        if let Some(temp_id) = record.record_temp_id() {
            pipe.set(self.store.temp_index_key(self.kind, &temp_id), &id);
        }
        pipe.query_async::<()>(&mut conn).await.map_err(conn_err)?;
        Ok(())
    }

    async fn delete(&self, id: &str, status: &str) -> StoreResult<bool> {
        // Read first so the index entries can be settled; the removal
        // itself is a single MULTI/EXEC.
        let record = self.get(id, status).await?;
        let key = self.store.record_key(self.kind, status, id);
        let partition = self.store.partition_key(self.kind, status);

        let mut conn = self.store.conn().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(&key);
        pipe.srem(&partition, id);
        if let Some(record) = &record {
            if let Some(address) = record.record_address() {
                pipe.del(self.store.address_index_key(self.kind, &address));
            }
            if let Some(temp_id) = record.record_temp_id() {
                pipe.del(self.store.temp_index_key(self.kind, &temp_id));
            }
        }
        pipe.query_async::<()>(&mut conn).await.map_err(conn_err)?;
        Ok(record.is_some())
    }

    async fn get(&self, id: &str, status: &str) -> StoreResult<Option<R>> {
        let key = self.store.record_key(self.kind, status, id);
        let mut conn = self.store.conn().await?;
        let map: HashMap<String, String> = conn.hgetall(&key).await.map_err(conn_err)?;
        if map.is_empty() {
            return Ok(None);
        }
        R::from_fields(&map)
            .map(Some)
            .map_err(|reason| StoreError::Corrupt { key, reason })
    }

    /// Scan a whole partition, skipping records that fail to deserialize.
    async fn load(&self, status: &str) -> StoreResult<Vec<R>> {
        let partition = self.store.partition_key(self.kind, status);
        let mut conn = self.store.conn().await?;
        let ids: Vec<String> = conn.smembers(&partition).await.map_err(conn_err)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.hgetall(self.store.record_key(self.kind, status, id));
        }
        let maps: Vec<HashMap<String, String>> =
            pipe.query_async(&mut conn).await.map_err(conn_err)?;

        let mut records = Vec::with_capacity(maps.len());
        for (i, map) in maps.into_iter().enumerate() {
            if map.is_empty() {
                // Record deleted between SMEMBERS and HGETALL, skip
                continue;
            }
            match R::from_fields(&map) {
                Ok(record) => records.push(record),
                Err(reason) => {
                    warn!(
                        id = %ids[i],
                        partition = %partition,
                        %reason,
                        "Skipping corrupt registry record during load"
                    );
                }
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl<R: HashRecord> EntityStore<R> for RedisEntityStore<R> {
    async fn save_active(&self, record: &R) -> StoreResult<()> {
        self.save(record, "active").await
    }

    async fn save_unavailable(&self, record: &R) -> StoreResult<()> {
        self.save(record, "unavailable").await
    }

    async fn delete_active(&self, id: &str) -> StoreResult<bool> {
        self.delete(id, "active").await
    }

    async fn delete_unavailable(&self, id: &str) -> StoreResult<bool> {
        self.delete(id, "unavailable").await
    }

    async fn get_active(&self, id: &str) -> StoreResult<Option<R>> {
        self.get(id, "active").await
    }

    async fn get_unavailable(&self, id: &str) -> StoreResult<Option<R>> {
        self.get(id, "unavailable").await
    }

    async fn load_active(&self) -> StoreResult<Vec<R>> {
        self.load("active").await
    }

    async fn load_unavailable(&self) -> StoreResult<Vec<R>> {
        self.load("unavailable").await
    }

    async fn id_for_address(&self, address: &str) -> StoreResult<Option<String>> {
        let mut conn = self.store.conn().await?;
        conn.get(self.store.address_index_key(self.kind, address))
            .await
            .map_err(conn_err)
    }

    async fn id_for_temp(&self, temp_id: &str) -> StoreResult<Option<String>> {
        let mut conn = self.store.conn().await?;
        conn.get(self.store.temp_index_key(self.kind, temp_id))
            .await
            .map_err(conn_err)
    }

    async fn unbind_temp(&self, temp_id: &str) -> StoreResult<()> {
        let mut conn = self.store.conn().await?;
        conn.del::<_, ()>(self.store.temp_index_key(self.kind, temp_id))
            .await
            .map_err(conn_err)?;
        Ok(())
    }
}

// ============================================================================
// PART 4: Slot / capacity store
// ============================================================================

pub struct RedisSlotStore {
    store: RedisStore,
}

impl RedisSlotStore {
    pub(crate) fn new(store: RedisStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SlotStore for RedisSlotStore {
    async fn set_capacity(
        &self,
        server: &ServerId,
        family: &str,
        remaining: u32,
    ) -> StoreResult<()> {
        let mut conn = self.store.conn().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset(self.store.capacity_key(family), &server.0, remaining);
        if remaining > 0 {
            pipe.sadd(self.store.advertisers_key(family), &server.0);
        } else {
            pipe.srem(self.store.advertisers_key(family), &server.0);
        }
        pipe.query_async::<()>(&mut conn).await.map_err(conn_err)?;
        Ok(())
    }

    async fn remaining(&self, server: &ServerId, family: &str) -> StoreResult<Option<u32>> {
        let mut conn = self.store.conn().await?;
        conn.hget(self.store.capacity_key(family), &server.0)
            .await
            .map_err(conn_err)
    }

    async fn reserve_capacity(
        &self,
        server: &ServerId,
        family: &str,
    ) -> StoreResult<CapacityReservation> {
        let mut conn = self.store.conn().await?;
        let remaining: i64 = scripts::RESERVE_CAPACITY
            .key(self.store.capacity_key(family))
            .key(self.store.advertisers_key(family))
            .arg(&server.0)
            .invoke_async(&mut conn)
            .await
            .map_err(script_err)?;
        if remaining < 0 {
            Ok(CapacityReservation::NoCapacity)
        } else {
            Ok(CapacityReservation::Reserved {
                remaining: remaining as u32,
            })
        }
    }

    async fn release_capacity(&self, server: &ServerId, family: &str) -> StoreResult<u32> {
        let mut conn = self.store.conn().await?;
        let remaining: i64 = scripts::RELEASE_CAPACITY
            .key(self.store.capacity_key(family))
            .key(self.store.advertisers_key(family))
            .arg(&server.0)
            .invoke_async(&mut conn)
            .await
            .map_err(script_err)?;
        Ok(remaining.max(0) as u32)
    }

    async fn clear_capacity(&self, server: &ServerId, family: &str) -> StoreResult<()> {
        let mut conn = self.store.conn().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hdel(self.store.capacity_key(family), &server.0);
        pipe.srem(self.store.advertisers_key(family), &server.0);
        pipe.query_async::<()>(&mut conn).await.map_err(conn_err)?;
        Ok(())
    }

    async fn advertisers(&self, family: &str) -> StoreResult<Vec<ServerId>> {
        let mut conn = self.store.conn().await?;
        let members: Vec<String> = conn
            .smembers(self.store.advertisers_key(family))
            .await
            .map_err(conn_err)?;
        Ok(members.into_iter().map(ServerId::from).collect())
    }

    async fn store_slot(&self, slot: &LogicalSlot) -> StoreResult<()> {
        let key = self.store.slot_key(&slot.id.0);
        let mut conn = self.store.conn().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(&key);
        for (field, value) in slot.to_fields() {
            pipe.hset(&key, field, value);
        }
        pipe.sadd(self.store.slots_set_key(), &slot.id.0);
        pipe.query_async::<()>(&mut conn).await.map_err(conn_err)?;
        Ok(())
    }

    async fn load_slot(&self, id: &SlotId) -> StoreResult<Option<LogicalSlot>> {
        let key = self.store.slot_key(&id.0);
        let mut conn = self.store.conn().await?;
        let map: HashMap<String, String> = conn.hgetall(&key).await.map_err(conn_err)?;
        if map.is_empty() {
            return Ok(None);
        }
        LogicalSlot::from_fields(&map)
            .map(Some)
            .map_err(|reason| StoreError::Corrupt { key, reason })
    }

    async fn remove_slot(&self, id: &SlotId) -> StoreResult<Option<LogicalSlot>> {
        let slot = self.load_slot(id).await?;
        let mut conn = self.store.conn().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(self.store.slot_key(&id.0));
        pipe.srem(self.store.slots_set_key(), &id.0);
        // Drop the member set too; occupants were already reassigned or
        // disconnected by the time a slot is removed.
        pipe.del(format!("{}{}", self.store.slot_players_prefix(), id.0));
        pipe.query_async::<()>(&mut conn).await.map_err(conn_err)?;
        Ok(slot)
    }

    async fn list_slots(&self) -> StoreResult<Vec<LogicalSlot>> {
        let mut conn = self.store.conn().await?;
        let ids: Vec<String> = conn
            .smembers(self.store.slots_set_key())
            .await
            .map_err(conn_err)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.hgetall(self.store.slot_key(id));
        }
        let maps: Vec<HashMap<String, String>> =
            pipe.query_async(&mut conn).await.map_err(conn_err)?;

        let mut slots = Vec::with_capacity(maps.len());
        for (i, map) in maps.into_iter().enumerate() {
            if map.is_empty() {
                continue;
            }
            match LogicalSlot::from_fields(&map) {
                Ok(slot) => slots.push(slot),
                Err(reason) => {
                    warn!(id = %ids[i], %reason, "Skipping corrupt slot record");
                }
            }
        }
        Ok(slots)
    }

    async fn reassign_player_slot(
        &self,
        player: &str,
        slot: &SlotId,
    ) -> StoreResult<Option<SlotId>> {
        let mut conn = self.store.conn().await?;
        let previous: Option<String> = scripts::REASSIGN_PLAYER_SLOT
            .key(self.store.player_slot_key())
            .key(format!("{}{}", self.store.slot_players_prefix(), slot.0))
            .arg(player)
            .arg(&slot.0)
            .arg(self.store.slot_players_prefix())
            .invoke_async(&mut conn)
            .await
            .map_err(script_err)?;
        Ok(previous.map(SlotId::from))
    }

    async fn player_slot(&self, player: &str) -> StoreResult<Option<SlotId>> {
        let mut conn = self.store.conn().await?;
        let slot: Option<String> = conn
            .hget(self.store.player_slot_key(), player)
            .await
            .map_err(conn_err)?;
        Ok(slot.map(SlotId::from))
    }

    async fn create_reservation(
        &self,
        player: &str,
        token: &str,
        slot: &SlotId,
        ttl_ms: u64,
    ) -> StoreResult<()> {
        let mut conn = self.store.conn().await?;
        let value = format!("{token}:{}", slot.0);
        let created: Option<String> = redis::cmd("SET")
            .arg(self.store.reservation_key(player))
            .arg(&value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(conn_err)?;
        if created.is_none() {
            return Err(StoreError::ReservationLocked {
                player: player.to_string(),
            });
        }
        Ok(())
    }

    async fn consume_reservation(
        &self,
        player: &str,
        token: &str,
        slot: &SlotId,
    ) -> StoreResult<()> {
        let mut conn = self.store.conn().await?;
        let expected = format!("{token}:{}", slot.0);
        let outcome: String = scripts::CONSUME_RESERVATION
            .key(self.store.reservation_key(player))
            .arg(&expected)
            .invoke_async(&mut conn)
            .await
            .map_err(script_err)?;
        match outcome.as_str() {
            "ok" => Ok(()),
            "expired" => Err(StoreError::ReservationExpired {
                player: player.to_string(),
            }),
            found => Err(StoreError::ReservationMismatch {
                player: player.to_string(),
                expected,
                found: found.to_string(),
            }),
        }
    }
}

/// Build the full set of Redis-backed stores over one shared pool.
pub(crate) fn build_redis_stores(
    config: RedisConfig,
) -> Result<
    (
        RedisIdStore,
        RedisEntityStore<fulcrum_protocol::RegisteredServer>,
        RedisEntityStore<fulcrum_protocol::RegisteredProxy>,
        RedisSlotStore,
    ),
    String,
> {
    let store = RedisStore::new(config)?;
    Ok((
        RedisIdStore::new(store.clone()),
        RedisEntityStore::new(store.clone(), EntityKind::Servers),
        RedisEntityStore::new(store.clone(), EntityKind::Proxies),
        RedisSlotStore::new(store),
    ))
}
