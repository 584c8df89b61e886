//! Cached entity records.

use crate::{EntityId, EntityType, Timestamp, TripId, Version};
use serde::{Deserialize, Serialize};

/// A locally held, possibly stale copy of a server entity.
///
/// Never authoritative: whenever the server disagrees, the server wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedEntity {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    /// Owning trip, used for bulk reads and eviction
    pub trip_id: TripId,
    pub data: serde_json::Value,
    /// When this copy was written (milliseconds since epoch)
    pub cached_at: Timestamp,
    /// Server version at the time of caching, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
}

impl CachedEntity {
    pub fn new(
        entity_type: EntityType,
        entity_id: impl Into<EntityId>,
        trip_id: impl Into<TripId>,
        data: serde_json::Value,
        cached_at: Timestamp,
        version: Option<Version>,
    ) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            trip_id: trip_id.into(),
            data,
            cached_at,
            version,
        }
    }

    /// Composite primary key: `entityType:entityId`.
    pub fn key(&self) -> String {
        cache_key(self.entity_type, &self.entity_id)
    }

    /// Whether this entry has outlived `ttl_ms` at time `now`.
    pub fn is_expired(&self, now: Timestamp, ttl_ms: u64) -> bool {
        now.saturating_sub(self.cached_at) >= ttl_ms
    }
}

/// Build the cache key for an entity.
pub fn cache_key(entity_type: EntityType, entity_id: &str) -> String {
    format!("{}:{}", entity_type.as_str(), entity_id)
}

const PROVISIONAL_PREFIX: &str = "local-";

/// Entity id under which a queued create is cached until the server assigns
/// the real one.
pub fn provisional_id(operation_id: &str) -> EntityId {
    format!("{PROVISIONAL_PREFIX}{operation_id}")
}

/// The queued create behind a provisional entity id, if it is one.
pub fn provisional_origin(entity_id: &str) -> Option<&str> {
    entity_id.strip_prefix(PROVISIONAL_PREFIX)
}
