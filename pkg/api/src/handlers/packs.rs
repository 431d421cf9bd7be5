use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use pkg_types::pack::{PackMetadata, PackSpec};

use crate::{AppState, error_response};

/// POST /api/v1/packs — register a pack version.
pub async fn register_pack(
    State(state): State<AppState>,
    Json(spec): Json<PackSpec>,
) -> impl IntoResponse {
    match state.store.register_pack(spec).await {
        Ok(pack) => (StatusCode::CREATED, Json(pack)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /api/v1/packs — list all registered packs.
pub async fn list_packs(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.packs())
}

/// PUT /api/v1/packs/:id/metadata — the only mutable part of a pack.
pub async fn update_pack_metadata(
    State(state): State<AppState>,
    Path(pack_id): Path<Uuid>,
    Json(metadata): Json<PackMetadata>,
) -> impl IntoResponse {
    match state.store.update_pack_metadata(pack_id, metadata).await {
        Ok(pack) => Json(pack).into_response(),
        Err(e) => error_response(&e),
    }
}

/// DELETE /api/v1/packs/:id — remove a pack no pod references.
pub async fn delete_pack(
    State(state): State<AppState>,
    Path(pack_id): Path<Uuid>,
) -> impl IntoResponse {
    match state.store.delete_pack(pack_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}
