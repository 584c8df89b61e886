//! Entity cache - read-through copies of server entities with a fixed TTL.
//!
//! Expired rows are treated as absent. [`EntityCache::get`] deletes them on the
//! way out; [`EntityCache::evict_expired`] sweeps the whole table.

use crate::{
    clock::{self, Clock},
    error::Result,
    record::cache_key,
    store::LocalStore,
    CachedEntity, EntityType, SyncConfig, Timestamp, Version,
};
use std::sync::Arc;

/// Cache of server entities backed by the local store's cache table.
#[derive(Clone)]
pub struct EntityCache {
    store: Arc<dyn LocalStore>,
    clock: Arc<dyn Clock>,
    /// Time-to-live in milliseconds
    ttl: Timestamp,
}

impl EntityCache {
    pub fn new(store: Arc<dyn LocalStore>, clock: Arc<dyn Clock>, config: &SyncConfig) -> Self {
        Self {
            store,
            clock,
            ttl: clock::millis(config.cache_ttl),
        }
    }

    /// Insert or overwrite an entity, stamping it with the current time.
    pub async fn put(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        trip_id: &str,
        data: serde_json::Value,
        version: Option<Version>,
    ) -> Result<CachedEntity> {
        let entity = CachedEntity::new(
            entity_type,
            entity_id,
            trip_id,
            data,
            self.clock.now_millis(),
            version,
        );
        self.store.put_cached(entity.clone()).await?;
        tracing::debug!(
            entity_type = %entity_type,
            entity_id,
            trip_id,
            "Cached entity"
        );
        Ok(entity)
    }

    /// Look up an entity. Expired entries are deleted and reported absent.
    pub async fn get(&self, entity_type: EntityType, entity_id: &str) -> Result<Option<CachedEntity>> {
        let key = cache_key(entity_type, entity_id);
        let Some(entity) = self.store.get_cached(&key).await? else {
            return Ok(None);
        };

        if entity.is_expired(self.clock.now_millis(), self.ttl) {
            self.store.delete_cached(&key).await?;
            tracing::debug!(key = %key, "Dropped expired cache entry");
            return Ok(None);
        }

        Ok(Some(entity))
    }

    /// All live entries of a trip, optionally narrowed to one entity type.
    ///
    /// Expired entries are filtered out but left for [`Self::evict_expired`].
    pub async fn get_all_for_trip(
        &self,
        trip_id: &str,
        entity_type: Option<EntityType>,
    ) -> Result<Vec<CachedEntity>> {
        let now = self.clock.now_millis();
        let mut entities: Vec<_> = self
            .store
            .cached_by_trip(trip_id)
            .await?
            .into_iter()
            .filter(|e| entity_type.map_or(true, |t| e.entity_type == t))
            .filter(|e| !e.is_expired(now, self.ttl))
            .collect();
        entities.sort_by(|a, b| (a.cached_at, a.key()).cmp(&(b.cached_at, b.key())));
        Ok(entities)
    }

    /// Delete an entry. Absent entries are not an error.
    pub async fn remove(&self, entity_type: EntityType, entity_id: &str) -> Result<()> {
        self.store
            .delete_cached(&cache_key(entity_type, entity_id))
            .await?;
        Ok(())
    }

    /// Delete every expired entry. Returns how many were removed.
    pub async fn evict_expired(&self) -> Result<usize> {
        let now = self.clock.now_millis();
        let mut evicted = 0;
        for entity in self.store.all_cached().await? {
            if entity.is_expired(now, self.ttl) && self.store.delete_cached(&entity.key()).await? {
                evicted += 1;
            }
        }
        if evicted > 0 {
            tracing::info!(evicted, "Evicted expired cache entries");
        }
        Ok(evicted)
    }
}
