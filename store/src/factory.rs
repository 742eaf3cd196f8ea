//! Backend selection and store construction.

use std::sync::Arc;

use fulcrum_protocol::{RegisteredProxy, RegisteredServer};

use crate::config::{RedisConfig, StoreBackend};
use crate::core::{EntityStore, IdStore, SlotStore, StoreError};
use crate::memory::{MemoryEntityStore, MemoryIdStore, MemorySlotStore};
use crate::redis::build_redis_stores;

/// The full set of stores the registry service operates on, behind trait
/// objects so backends are swappable per configuration.
#[derive(Clone)]
pub struct StoreBundle {
    pub ids: Arc<dyn IdStore>,
    pub servers: Arc<dyn EntityStore<RegisteredServer>>,
    pub proxies: Arc<dyn EntityStore<RegisteredProxy>>,
    pub slots: Arc<dyn SlotStore>,
}

/// Configuration for [`create_store`].
#[derive(Debug, Clone, Default)]
pub struct StoreFactoryConfig {
    pub backend: StoreBackend,
    pub redis: RedisConfig,
}

/// Build the configured storage backend.
pub fn create_store(config: StoreFactoryConfig) -> Result<StoreBundle, StoreError> {
    match config.backend {
        StoreBackend::Memory => Ok(StoreBundle {
            ids: Arc::new(MemoryIdStore::new()),
            servers: Arc::new(MemoryEntityStore::new()),
            proxies: Arc::new(MemoryEntityStore::new()),
            slots: Arc::new(MemorySlotStore::new()),
        }),
        StoreBackend::Redis => {
            config
                .redis
                .validate()
                .map_err(StoreError::Connection)?;
            let (ids, servers, proxies, slots) =
                build_redis_stores(config.redis).map_err(StoreError::Connection)?;
            Ok(StoreBundle {
                ids: Arc::new(ids),
                servers: Arc::new(servers),
                proxies: Arc::new(proxies),
                slots: Arc::new(slots),
            })
        }
    }
}
