//! Error types for the tripsync engine.

use crate::{EntityId, EntityType, OperationType, Version};
use thiserror::Error;

/// All possible errors from the tripsync engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("entity type '{0}' cannot be mutated offline")]
    DisallowedEntityType(EntityType),

    #[error("unknown entity type: {0}")]
    UnknownEntityType(String),

    #[error("unknown operation type: {0}")]
    UnknownOperationType(String),

    #[error("{operation} on {entity_type} requires an entity id")]
    MissingEntityId {
        entity_type: EntityType,
        operation: OperationType,
    },

    #[error("invalid {entity_type} payload: {reason}")]
    InvalidPayload {
        entity_type: EntityType,
        reason: String,
    },

    // Remote errors
    #[error("{entity_type} not found: {entity_id}")]
    EntityNotFound {
        entity_type: EntityType,
        entity_id: EntityId,
    },

    #[error("version conflict on {entity_type} {entity_id}: expected {expected}, server has {actual:?}")]
    VersionConflict {
        entity_type: EntityType,
        entity_id: EntityId,
        expected: Version,
        actual: Option<Version>,
    },

    #[error("{entity_type} {entity_id} was modified by another user ({attempts} attempts)")]
    ModifiedByAnotherUser {
        entity_type: EntityType,
        entity_id: EntityId,
        attempts: u32,
    },

    #[error("remote unavailable: {0}")]
    Remote(String),

    #[error("remote rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    // Local state errors
    #[error("local store error: {0}")]
    Store(String),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("invalid backend url: {0}")]
    InvalidUrl(String),
}

impl Error {
    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Remote(_))
    }

    /// Whether this is an optimistic-concurrency version conflict.
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Error::VersionConflict { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Store(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
