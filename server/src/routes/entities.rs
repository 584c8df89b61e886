//! Entity endpoint routes.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tripsync_engine::{CreateEntityRequest, RemoteEntity, UpdateEntityRequest};

use crate::error::Result;
use crate::handlers::{handle_create, handle_delete, handle_get, handle_list, handle_update};
use crate::AppState;

/// Create entity routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/trips/{trip_id}/entities/{entity_type}",
            post(create_handler).get(list_handler),
        )
        .route(
            "/entities/{entity_type}/{entity_id}",
            get(get_handler).put(update_handler).delete(delete_handler),
        )
}

/// POST /trips/{trip_id}/entities/{entity_type} - Create an entity.
///
/// Answers 201 for a fresh insert and 200 when an idempotent replay found
/// the entity from an earlier request.
async fn create_handler(
    State(state): State<AppState>,
    Path((trip_id, entity_type)): Path<(String, String)>,
    Json(request): Json<CreateEntityRequest>,
) -> Result<(StatusCode, Json<RemoteEntity>)> {
    let created = handle_create(&state.pool, &trip_id, &entity_type, request).await?;
    let status = if created.inserted {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(created.entity)))
}

/// GET /trips/{trip_id}/entities/{entity_type} - List a trip's entities.
async fn list_handler(
    State(state): State<AppState>,
    Path((trip_id, entity_type)): Path<(String, String)>,
) -> Result<Json<Vec<RemoteEntity>>> {
    let entities = handle_list(&state.pool, &trip_id, &entity_type).await?;
    Ok(Json(entities))
}

/// GET /entities/{entity_type}/{entity_id} - Fetch one entity.
async fn get_handler(
    State(state): State<AppState>,
    Path((entity_type, entity_id)): Path<(String, String)>,
) -> Result<Json<RemoteEntity>> {
    let entity = handle_get(&state.pool, &entity_type, &entity_id).await?;
    Ok(Json(entity))
}

/// PUT /entities/{entity_type}/{entity_id} - Versioned update.
async fn update_handler(
    State(state): State<AppState>,
    Path((entity_type, entity_id)): Path<(String, String)>,
    Json(request): Json<UpdateEntityRequest>,
) -> Result<Json<RemoteEntity>> {
    let entity = handle_update(&state.pool, &entity_type, &entity_id, request).await?;
    Ok(Json(entity))
}

/// DELETE /entities/{entity_type}/{entity_id} - Delete an entity.
async fn delete_handler(
    State(state): State<AppState>,
    Path((entity_type, entity_id)): Path<(String, String)>,
) -> Result<StatusCode> {
    handle_delete(&state.pool, &entity_type, &entity_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
