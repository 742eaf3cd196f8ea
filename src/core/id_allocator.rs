//! Identifier allocation with contiguous low-numbered recycling.
//!
//! Server numbers are scoped per family, proxy numbers share one fixed
//! scope. Released numbers enter a recycle pool and the lowest one wins
//! before the counter advances, so fleets stay contiguously numbered. All
//! pool and counter mutations are single atomic store operations; two
//! processes allocating concurrently can never receive the same number.

use std::sync::Arc;

use fulcrum_protocol::{ProxyId, ServerId, SlotId};
use registry_store::IdStore;
use tracing::{debug, info};

use crate::error::{RegistryError, RegistryResult};

const PROXY_SCOPE: &str = "proxies";

fn server_scope(family: &str) -> String {
    format!("servers:{family}")
}

/// Allocates and reclaims fleet identifiers. Constructed once and shared;
/// owns no state of its own beyond the store handle.
pub struct IdAllocator {
    ids: Arc<dyn IdStore>,
}

impl IdAllocator {
    pub fn new(ids: Arc<dyn IdStore>) -> Self {
        Self { ids }
    }

    /// Next server id for `family`: lowest recycled number first, else the
    /// counter advances.
    pub async fn allocate_server_id(&self, family: &str) -> RegistryResult<ServerId> {
        let number = self.ids.allocate_numeric(&server_scope(family)).await?;
        let id = ServerId::new(family, number);
        debug!(%id, family, "Allocated server id");
        Ok(id)
    }

    /// Lowest unused slot letter under `base`. Fails once all 26 are taken.
    pub async fn allocate_slot_id(&self, base: &ServerId) -> RegistryResult<SlotId> {
        match self.ids.allocate_letter(&base.0).await? {
            Some(letter) => {
                let id = SlotId::new(base, letter);
                debug!(%id, base = %base, "Allocated slot id");
                Ok(id)
            }
            None => Err(RegistryError::SlotLimitExceeded {
                base_id: base.clone(),
            }),
        }
    }

    pub async fn allocate_proxy_id(&self) -> RegistryResult<ProxyId> {
        let number = self.ids.allocate_numeric(PROXY_SCOPE).await?;
        let id = ProxyId::new(number);
        debug!(%id, "Allocated proxy id");
        Ok(id)
    }

    /// Release a server id or a slot id given its raw form. A letter suffix
    /// frees only that letter; a base id recycles the number and drops any
    /// still-allocated letters under it.
    pub async fn release(&self, raw: &str) -> RegistryResult<()> {
        if let Ok(slot) = SlotId::parse(raw) {
            self.release_slot_id(&slot).await?;
            return Ok(());
        }
        let id = ServerId::parse(raw)?;
        self.release_server_id(&id).await
    }

    /// Return a base server number to its family's recycle pool, cascading
    /// the release of every slot letter still allocated under it.
    pub async fn release_server_id(&self, id: &ServerId) -> RegistryResult<()> {
        let number = id
            .number()
            .ok_or_else(|| RegistryError::UnknownEntity(id.0.clone()))?;
        self.ids
            .release_numeric(&server_scope(id.family()), number, Some(id.0.as_str()))
            .await?;
        info!(%id, "Released server id");
        Ok(())
    }

    /// Free a single slot letter. Returns whether it was allocated.
    pub async fn release_slot_id(&self, id: &SlotId) -> RegistryResult<bool> {
        let base = id.server_id();
        let letter = id
            .letter()
            .ok_or_else(|| RegistryError::UnknownEntity(id.0.clone()))?;
        let released = self.ids.release_letter(&base.0, letter).await?;
        debug!(%id, released, "Released slot id");
        Ok(released)
    }

    /// Return a proxy number to the recycle pool.
    ///
    /// This is the only path that makes a proxy number reusable, and it is
    /// never wired to raw connection loss; callers reach it through an
    /// explicit release decision after a confirmed-dead timeout.
    pub async fn release_proxy_id(&self, id: &ProxyId) -> RegistryResult<()> {
        let number = id
            .number()
            .ok_or_else(|| RegistryError::UnknownEntity(id.0.clone()))?;
        self.ids.release_numeric(PROXY_SCOPE, number, None).await?;
        info!(%id, "Released proxy id");
        Ok(())
    }

    /// Idempotently import an externally-known server id: removes it from
    /// the recycle pool without allocating and keeps the counter ahead of
    /// it. Returns whether the pool held the number.
    pub async fn claim_server_id(&self, id: &ServerId) -> RegistryResult<bool> {
        let number = id
            .number()
            .ok_or_else(|| RegistryError::UnknownEntity(id.0.clone()))?;
        let claimed = self
            .ids
            .claim_numeric(&server_scope(id.family()), number)
            .await?;
        debug!(%id, claimed, "Claimed server id");
        Ok(claimed)
    }

    pub async fn used_letters(&self, base: &ServerId) -> RegistryResult<Vec<char>> {
        Ok(self.ids.used_letters(&base.0).await?)
    }
}

#[cfg(test)]
mod tests {
    use registry_store::MemoryIdStore;

    use super::*;

    fn allocator() -> IdAllocator {
        IdAllocator::new(Arc::new(MemoryIdStore::new()))
    }

    #[tokio::test]
    async fn server_ids_are_strictly_increasing_without_releases() {
        let alloc = allocator();
        let mut previous = 0;
        for _ in 0..10 {
            let id = alloc.allocate_server_id("mini").await.unwrap();
            let number = id.number().unwrap();
            assert!(number > previous, "numbers must strictly increase");
            previous = number;
        }
    }

    #[tokio::test]
    async fn families_number_independently() {
        let alloc = allocator();
        assert_eq!(alloc.allocate_server_id("mini").await.unwrap().0, "mini1");
        assert_eq!(alloc.allocate_server_id("mega").await.unwrap().0, "mega1");
        assert_eq!(alloc.allocate_server_id("mini").await.unwrap().0, "mini2");
    }

    #[tokio::test]
    async fn released_server_id_is_reallocated_lowest_first() {
        let alloc = allocator();
        for _ in 0..3 {
            alloc.allocate_server_id("mini").await.unwrap();
        }
        alloc
            .release_server_id(&ServerId::from("mini1"))
            .await
            .unwrap();
        assert_eq!(alloc.allocate_server_id("mini").await.unwrap().0, "mini1");
    }

    #[tokio::test]
    async fn slot_letters_exhaust_with_typed_error() {
        let alloc = allocator();
        let base = ServerId::from("mini1");
        for expected in 'A'..='Z' {
            let slot = alloc.allocate_slot_id(&base).await.unwrap();
            assert_eq!(slot.letter(), Some(expected));
        }
        let err = alloc.allocate_slot_id(&base).await.unwrap_err();
        assert!(matches!(err, RegistryError::SlotLimitExceeded { .. }));
    }

    #[tokio::test]
    async fn releasing_base_id_cascades_slot_letters() {
        let alloc = allocator();
        let base = alloc.allocate_server_id("mini").await.unwrap();
        for _ in 0..3 {
            alloc.allocate_slot_id(&base).await.unwrap();
        }
        alloc.release_server_id(&base).await.unwrap();
        assert!(alloc.used_letters(&base).await.unwrap().is_empty());

        // The recycled base starts its letter pool fresh.
        let again = alloc.allocate_server_id("mini").await.unwrap();
        assert_eq!(again, base);
        assert_eq!(
            alloc.allocate_slot_id(&again).await.unwrap().letter(),
            Some('A')
        );
    }

    #[tokio::test]
    async fn release_dispatches_on_raw_form() {
        let alloc = allocator();
        let base = alloc.allocate_server_id("mini").await.unwrap();
        let slot = alloc.allocate_slot_id(&base).await.unwrap();

        // Releasing the slot frees only the letter.
        alloc.release(&slot.0).await.unwrap();
        assert!(alloc.used_letters(&base).await.unwrap().is_empty());
        let next = alloc.allocate_server_id("mini").await.unwrap();
        assert_ne!(next, base, "base number must still be allocated");
    }

    #[tokio::test]
    async fn proxy_numbers_only_reissue_after_explicit_release() {
        let alloc = allocator();
        let first = alloc.allocate_proxy_id().await.unwrap();
        assert_eq!(first.number(), Some(1));

        // No release: a reconnecting proxy gets a fresh number.
        assert_eq!(alloc.allocate_proxy_id().await.unwrap().number(), Some(2));

        alloc.release_proxy_id(&first).await.unwrap();
        assert_eq!(alloc.allocate_proxy_id().await.unwrap(), first);
    }

    #[tokio::test]
    async fn claim_prevents_future_collision() {
        let alloc = allocator();
        let imported = ServerId::from("mini5");
        alloc.claim_server_id(&imported).await.unwrap();
        assert_eq!(alloc.allocate_server_id("mini").await.unwrap().0, "mini6");
    }
}
