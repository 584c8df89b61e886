//! Remote backend interface and the wire types it shares with the server.

use crate::{error::Result, EntityId, EntityType, TripId, Version};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Server-side state of an entity, as returned by every successful read or
/// write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntity {
    pub entity_id: EntityId,
    pub entity_type: EntityType,
    pub trip_id: TripId,
    pub data: serde_json::Value,
    /// Optimistic-concurrency version, incremented on every write
    pub version: Version,
}

impl RemoteEntity {
    pub fn new(
        entity_id: impl Into<EntityId>,
        entity_type: EntityType,
        trip_id: impl Into<TripId>,
        data: serde_json::Value,
        version: Version,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            entity_type,
            trip_id: trip_id.into(),
            data,
            version,
        }
    }
}

/// Body of `POST /trips/{trip_id}/entities/{entity_type}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEntityRequest {
    pub payload: serde_json::Value,
    /// Client-generated key; replaying a create with the same key returns
    /// the entity created the first time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// Body of `PUT /entities/{entity_type}/{entity_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEntityRequest {
    pub payload: serde_json::Value,
    /// Version the client last observed
    pub version: Version,
}

/// Error body returned by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Present on version conflicts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_version: Option<Version>,
}

/// The authoritative store of trip entities.
///
/// Implementations report a stale `version` on update as
/// [`crate::Error::VersionConflict`], a missing entity as
/// [`crate::Error::EntityNotFound`], and transport trouble as
/// [`crate::Error::Remote`].
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Create an entity. Calls sharing an `idempotency_key` create it once.
    async fn create(
        &self,
        entity_type: EntityType,
        trip_id: &str,
        payload: serde_json::Value,
        idempotency_key: Option<&str>,
    ) -> Result<RemoteEntity>;

    /// Replace an entity's payload if its server version still equals
    /// `version`.
    async fn update(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        payload: serde_json::Value,
        version: Version,
    ) -> Result<RemoteEntity>;

    /// Delete an entity. Deleting an absent entity succeeds.
    async fn delete(&self, entity_type: EntityType, entity_id: &str) -> Result<()>;

    async fn fetch(&self, entity_type: EntityType, entity_id: &str) -> Result<RemoteEntity>;

    async fn list(&self, trip_id: &str, entity_type: EntityType) -> Result<Vec<RemoteEntity>>;
}
