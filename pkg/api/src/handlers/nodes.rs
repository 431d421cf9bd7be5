use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;
use uuid::Uuid;

use crate::{AppState, error_response};

/// GET /api/v1/nodes
pub async fn list_nodes(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.nodes())
}

/// POST /api/v1/nodes/:id/drain — cordon and empty a node; the eviction
/// controller reschedules its pods.
pub async fn drain_node(
    State(state): State<AppState>,
    Path(node_id): Path<Uuid>,
) -> impl IntoResponse {
    info!(node = %node_id, "drain requested");
    match state.store.drain_node(node_id).await {
        Ok(node) => Json(node).into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST /api/v1/nodes/:id/uncordon — make the node schedulable again.
pub async fn uncordon_node(
    State(state): State<AppState>,
    Path(node_id): Path<Uuid>,
) -> impl IntoResponse {
    match state.store.uncordon_node(node_id).await {
        Ok(node) => Json(node).into_response(),
        Err(e) => error_response(&e),
    }
}

/// DELETE /api/v1/nodes/:id — remove a node nothing runs on.
pub async fn delete_node(
    State(state): State<AppState>,
    Path(node_id): Path<Uuid>,
) -> impl IntoResponse {
    match state.store.delete_node(node_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}
