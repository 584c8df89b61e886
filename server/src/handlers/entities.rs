//! Entity handlers: validated, versioned writes over the entities table.

use crate::db::{self, StoredEntity, UpdateOutcome};
use crate::error::{AppError, Result};
use sqlx::PgPool;
use tripsync_engine::{
    CreateEntityRequest, EntityPayload, EntityType, RemoteEntity, UpdateEntityRequest,
};

/// Result of a create: the entity, and whether this call inserted it.
#[derive(Debug)]
pub struct Created {
    pub entity: RemoteEntity,
    /// False when an earlier request with the same idempotency key won
    pub inserted: bool,
}

/// Parse an entity type path segment.
pub fn parse_entity_type(raw: &str) -> Result<EntityType> {
    Ok(raw.parse::<EntityType>()?)
}

/// Decode and validate a payload, returning its canonical JSON form.
fn canonical_payload(entity_type: EntityType, payload: &serde_json::Value) -> Result<serde_json::Value> {
    Ok(EntityPayload::decode(entity_type, payload)?.to_value())
}

fn expected_version(version: u64) -> Result<i64> {
    i64::try_from(version).map_err(|_| AppError::BadRequest(format!("version {version} out of range")))
}

/// A row that no longer decodes is a server fault, not a bad request.
fn to_remote(stored: &StoredEntity) -> Result<RemoteEntity> {
    stored.to_remote().map_err(|e| {
        AppError::Internal(format!("stored entity {} is unreadable: {e}", stored.entity_id))
    })
}

/// Create an entity in a trip.
///
/// Replaying a request with an already used idempotency key returns the
/// entity from the first request instead of inserting a duplicate.
pub async fn handle_create(
    pool: &PgPool,
    trip_id: &str,
    entity_type: &str,
    request: CreateEntityRequest,
) -> Result<Created> {
    let entity_type = parse_entity_type(entity_type)?;
    if trip_id.trim().is_empty() {
        return Err(AppError::BadRequest("trip id must not be empty".to_string()));
    }
    let payload = canonical_payload(entity_type, &request.payload)?;
    let key = request.idempotency_key.as_deref();

    if let Some(key) = key {
        if let Some(existing) = db::get_entity_by_idempotency_key(pool, key).await? {
            tracing::debug!("Replayed create for key {}", key);
            return Ok(Created {
                entity: to_remote(&existing)?,
                inserted: false,
            });
        }
    }

    let entity_id = uuid::Uuid::new_v4().to_string();
    match db::insert_entity(pool, &entity_id, entity_type, trip_id, &payload, key).await {
        Ok(stored) => {
            tracing::info!("Created {} {} in trip {}", entity_type, entity_id, trip_id);
            Ok(Created {
                entity: to_remote(&stored)?,
                inserted: true,
            })
        }
        // A concurrent request with the same key got there first
        Err(e) if db::is_unique_violation(&e) => {
            let existing = match key {
                Some(key) => db::get_entity_by_idempotency_key(pool, key).await?,
                None => None,
            };
            match existing {
                Some(stored) => Ok(Created {
                    entity: to_remote(&stored)?,
                    inserted: false,
                }),
                None => Err(AppError::Database(e)),
            }
        }
        Err(e) => Err(e.into()),
    }
}

/// Replace an entity's payload under optimistic concurrency.
pub async fn handle_update(
    pool: &PgPool,
    entity_type: &str,
    entity_id: &str,
    request: UpdateEntityRequest,
) -> Result<RemoteEntity> {
    let entity_type = parse_entity_type(entity_type)?;
    let payload = canonical_payload(entity_type, &request.payload)?;
    let expected = expected_version(request.version)?;

    match db::update_entity(pool, entity_type, entity_id, &payload, expected).await? {
        UpdateOutcome::Updated(stored) => {
            tracing::debug!("Updated {} {} to version {}", entity_type, entity_id, stored.version);
            to_remote(&stored)
        }
        UpdateOutcome::Conflict { current_version } => {
            tracing::debug!(
                "Rejected stale update of {} {}: expected {}, current {}",
                entity_type,
                entity_id,
                expected,
                current_version
            );
            Err(AppError::VersionConflict {
                current_version: current_version.max(0) as u64,
            })
        }
        UpdateOutcome::NotFound => Err(not_found(entity_type, entity_id)),
    }
}

/// Delete an entity. Missing entities are reported as not found.
pub async fn handle_delete(pool: &PgPool, entity_type: &str, entity_id: &str) -> Result<()> {
    let entity_type = parse_entity_type(entity_type)?;
    if db::delete_entity(pool, entity_type, entity_id).await? {
        tracing::info!("Deleted {} {}", entity_type, entity_id);
        Ok(())
    } else {
        Err(not_found(entity_type, entity_id))
    }
}

/// Fetch one entity.
pub async fn handle_get(pool: &PgPool, entity_type: &str, entity_id: &str) -> Result<RemoteEntity> {
    let entity_type = parse_entity_type(entity_type)?;
    match db::get_entity(pool, entity_type, entity_id).await? {
        Some(stored) => to_remote(&stored),
        None => Err(not_found(entity_type, entity_id)),
    }
}

/// All entities of one type in a trip.
pub async fn handle_list(pool: &PgPool, trip_id: &str, entity_type: &str) -> Result<Vec<RemoteEntity>> {
    let entity_type = parse_entity_type(entity_type)?;
    db::list_entities(pool, trip_id, entity_type)
        .await?
        .iter()
        .map(to_remote)
        .collect()
}

fn not_found(entity_type: EntityType, entity_id: &str) -> AppError {
    AppError::NotFound(format!("{entity_type} not found: {entity_id}"))
}
