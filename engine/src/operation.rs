//! Queued operation types.
//!
//! Mutations made while offline are recorded as operations rather than
//! applied directly, so they can be replayed against the backend later.

use crate::{EntityId, EntityType, Error, OperationId, Timestamp, TripId, Version};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    pub const ALL: [OperationType; 3] = [
        OperationType::Create,
        OperationType::Update,
        OperationType::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
        }
    }

    /// Whether the operation targets an existing entity.
    pub fn requires_entity_id(&self) -> bool {
        !matches!(self, OperationType::Create)
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        OperationType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::UnknownOperationType(s.to_string()))
    }
}

/// Lifecycle status of a queued operation.
///
/// A successful operation is deleted from the queue, so there is no
/// "completed" status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Waiting for a processing pass
    Pending,
    /// Claimed by a processing pass that has not finished yet
    Syncing,
    /// Retries exhausted; only an explicit requeue brings it back
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pending mutation awaiting remote application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    /// Locally generated unique ID; doubles as the idempotency key of creates
    pub id: OperationId,
    pub entity_type: EntityType,
    pub operation_type: OperationType,
    /// Trip this operation belongs to
    pub trip_id: TripId,
    /// Target entity; absent for creates until the server assigns one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<EntityId>,
    /// Mutation body, opaque to the queue
    pub payload: serde_json::Value,
    /// When the operation was queued (milliseconds since epoch)
    pub enqueued_at: Timestamp,
    /// Failed attempts so far
    pub retry_count: u32,
    pub status: SyncStatus,
    /// Entity version the client last observed, for optimistic concurrency
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
}

impl QueuedOperation {
    /// Build a fresh `pending` operation.
    pub fn new(id: impl Into<OperationId>, op: NewOperation, enqueued_at: Timestamp) -> Self {
        Self {
            id: id.into(),
            entity_type: op.entity_type,
            operation_type: op.operation_type,
            trip_id: op.trip_id,
            entity_id: op.entity_id,
            payload: op.payload,
            enqueued_at,
            retry_count: 0,
            status: SyncStatus::Pending,
            version: op.version,
        }
    }

    /// Decode the payload into a concrete shape.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, Error> {
        T::deserialize(&self.payload).map_err(|e| Error::InvalidPayload {
            entity_type: self.entity_type,
            reason: e.to_string(),
        })
    }

    pub fn is_pending(&self) -> bool {
        self.status == SyncStatus::Pending
    }
}

/// Arguments for [`crate::SyncQueue::enqueue`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    pub entity_type: EntityType,
    pub operation_type: OperationType,
    pub trip_id: TripId,
    pub payload: serde_json::Value,
    pub entity_id: Option<EntityId>,
    pub version: Option<Version>,
}

impl NewOperation {
    /// Queue creation of a new entity.
    pub fn create(
        entity_type: EntityType,
        trip_id: impl Into<TripId>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            entity_type,
            operation_type: OperationType::Create,
            trip_id: trip_id.into(),
            payload,
            entity_id: None,
            version: None,
        }
    }

    /// Queue an update based on the last observed `version`, if known.
    pub fn update(
        entity_type: EntityType,
        trip_id: impl Into<TripId>,
        entity_id: impl Into<EntityId>,
        payload: serde_json::Value,
        version: Option<Version>,
    ) -> Self {
        Self {
            entity_type,
            operation_type: OperationType::Update,
            trip_id: trip_id.into(),
            payload,
            entity_id: Some(entity_id.into()),
            version,
        }
    }

    /// Queue deletion of an existing entity.
    pub fn delete(
        entity_type: EntityType,
        trip_id: impl Into<TripId>,
        entity_id: impl Into<EntityId>,
    ) -> Self {
        Self {
            entity_type,
            operation_type: OperationType::Delete,
            trip_id: trip_id.into(),
            payload: serde_json::Value::Null,
            entity_id: Some(entity_id.into()),
            version: None,
        }
    }
}

/// Optional constraints for [`crate::SyncQueue::list`]. Unset fields match
/// everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueFilter {
    pub status: Option<SyncStatus>,
    pub trip_id: Option<TripId>,
    pub entity_type: Option<EntityType>,
}

impl QueueFilter {
    pub fn status(mut self, status: SyncStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn trip(mut self, trip_id: impl Into<TripId>) -> Self {
        self.trip_id = Some(trip_id.into());
        self
    }

    pub fn entity_type(mut self, entity_type: EntityType) -> Self {
        self.entity_type = Some(entity_type);
        self
    }

    pub fn matches(&self, op: &QueuedOperation) -> bool {
        self.status.map_or(true, |s| op.status == s)
            && self.trip_id.as_ref().map_or(true, |t| &op.trip_id == t)
            && self.entity_type.map_or(true, |t| op.entity_type == t)
    }
}
