//! Database operations for the entities table.

use sqlx::{PgPool, Row};
use tripsync_engine::{EntityType, RemoteEntity};

/// A stored entity row from the database.
#[derive(Debug, Clone)]
pub struct StoredEntity {
    pub entity_id: String,
    pub entity_type: String,
    pub trip_id: String,
    pub payload: serde_json::Value,
    pub version: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredEntity {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredEntity {
            entity_id: row.try_get("entity_id")?,
            entity_type: row.try_get("entity_type")?,
            trip_id: row.try_get("trip_id")?,
            payload: row.try_get("payload")?,
            version: row.try_get("version")?,
        })
    }
}

impl StoredEntity {
    /// Convert database row to the wire representation.
    pub fn to_remote(&self) -> Result<RemoteEntity, tripsync_engine::Error> {
        Ok(RemoteEntity::new(
            &self.entity_id,
            self.entity_type.parse::<EntityType>()?,
            &self.trip_id,
            self.payload.clone(),
            self.version.max(0) as u64,
        ))
    }
}

const COLUMNS: &str = "entity_id, entity_type, trip_id, payload, version";

/// Insert a new entity at version 1.
///
/// Fails with a unique violation when `idempotency_key` was already used.
pub async fn insert_entity(
    pool: &PgPool,
    entity_id: &str,
    entity_type: EntityType,
    trip_id: &str,
    payload: &serde_json::Value,
    idempotency_key: Option<&str>,
) -> Result<StoredEntity, sqlx::Error> {
    sqlx::query_as::<_, StoredEntity>(&format!(
        r#"
        INSERT INTO entities (entity_id, entity_type, trip_id, payload, version, idempotency_key)
        VALUES ($1, $2, $3, $4, 1, $5)
        RETURNING {COLUMNS}
        "#
    ))
    .bind(entity_id)
    .bind(entity_type.as_str())
    .bind(trip_id)
    .bind(payload)
    .bind(idempotency_key)
    .fetch_one(pool)
    .await
}

/// Find the entity created with a given idempotency key.
pub async fn get_entity_by_idempotency_key(
    pool: &PgPool,
    idempotency_key: &str,
) -> Result<Option<StoredEntity>, sqlx::Error> {
    sqlx::query_as::<_, StoredEntity>(&format!(
        "SELECT {COLUMNS} FROM entities WHERE idempotency_key = $1"
    ))
    .bind(idempotency_key)
    .fetch_optional(pool)
    .await
}

/// Get a single entity.
pub async fn get_entity(
    pool: &PgPool,
    entity_type: EntityType,
    entity_id: &str,
) -> Result<Option<StoredEntity>, sqlx::Error> {
    sqlx::query_as::<_, StoredEntity>(&format!(
        "SELECT {COLUMNS} FROM entities WHERE entity_type = $1 AND entity_id = $2"
    ))
    .bind(entity_type.as_str())
    .bind(entity_id)
    .fetch_optional(pool)
    .await
}

/// All entities of one type in a trip, oldest first.
pub async fn list_entities(
    pool: &PgPool,
    trip_id: &str,
    entity_type: EntityType,
) -> Result<Vec<StoredEntity>, sqlx::Error> {
    sqlx::query_as::<_, StoredEntity>(&format!(
        r#"
        SELECT {COLUMNS} FROM entities
        WHERE trip_id = $1 AND entity_type = $2
        ORDER BY created_at ASC, entity_id ASC
        "#
    ))
    .bind(trip_id)
    .bind(entity_type.as_str())
    .fetch_all(pool)
    .await
}

/// Outcome of a conditional update.
#[derive(Debug)]
pub enum UpdateOutcome {
    Updated(StoredEntity),
    /// The stored version differs from the expected one
    Conflict { current_version: i64 },
    NotFound,
}

/// Replace an entity's payload if its version still equals
/// `expected_version`, incrementing the version in the same statement.
pub async fn update_entity(
    pool: &PgPool,
    entity_type: EntityType,
    entity_id: &str,
    payload: &serde_json::Value,
    expected_version: i64,
) -> Result<UpdateOutcome, sqlx::Error> {
    let updated = sqlx::query_as::<_, StoredEntity>(&format!(
        r#"
        UPDATE entities
        SET payload = $3, version = version + 1, updated_at = NOW()
        WHERE entity_type = $1 AND entity_id = $2 AND version = $4
        RETURNING {COLUMNS}
        "#
    ))
    .bind(entity_type.as_str())
    .bind(entity_id)
    .bind(payload)
    .bind(expected_version)
    .fetch_optional(pool)
    .await?;

    if let Some(entity) = updated {
        return Ok(UpdateOutcome::Updated(entity));
    }

    // Either the row is gone or someone else bumped the version.
    let current: Option<(i64,)> =
        sqlx::query_as("SELECT version FROM entities WHERE entity_type = $1 AND entity_id = $2")
            .bind(entity_type.as_str())
            .bind(entity_id)
            .fetch_optional(pool)
            .await?;

    Ok(match current {
        Some((current_version,)) => UpdateOutcome::Conflict { current_version },
        None => UpdateOutcome::NotFound,
    })
}

/// Delete an entity. Returns whether a row was removed.
pub async fn delete_entity(
    pool: &PgPool,
    entity_type: EntityType,
    entity_id: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM entities WHERE entity_type = $1 AND entity_id = $2")
        .bind(entity_type.as_str())
        .bind(entity_id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Check if a SQL error is a unique constraint violation.
pub fn is_unique_violation(e: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = e {
        // PostgreSQL unique violation code is "23505"
        db_err.code().map(|c| c == "23505").unwrap_or(false)
    } else {
        false
    }
}
