//! Thin admin REST surface and the control-plane assembly.
//!
//! Handlers adapt HTTP to state-store and scheduler calls; no business
//! logic lives here. The message channel for nodes and pods is served on
//! the same listener under `/channel`.

pub mod auth;
pub mod handlers;
pub mod server;

use std::sync::Arc;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use pkg_gateway::Gateway;
use pkg_metrics::MetricsRegistry;
use pkg_scheduler::Scheduler;
use pkg_state::StateStore;
use pkg_types::error::{Error, ErrorBody};

/// Shared application state injected into all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<StateStore>,
    pub gateway: Arc<Gateway>,
    pub scheduler: Arc<Scheduler>,
    pub metrics: Arc<MetricsRegistry>,
    pub admin_token: String,
}

/// Map the error taxonomy onto HTTP statuses, with the tagged body as JSON.
pub fn error_response(error: &Error) -> Response {
    let status = match error.code() {
        "POD_NOT_FOUND" | "PACK_NOT_FOUND" | "NODE_NOT_FOUND" | "NAMESPACE_MISSING"
        | "VERSION_NOT_FOUND" => StatusCode::NOT_FOUND,
        "NAME_TAKEN" | "VERSION_EXISTS" | "SAME_VERSION" | "INVALID_STATE"
        | "INVALID_STATUS_TRANSITION" => StatusCode::CONFLICT,
        "VALIDATION_ERROR" => StatusCode::UNPROCESSABLE_ENTITY,
        "QUOTA_EXCEEDED" | "NO_COMPATIBLE_NODES" | "INSUFFICIENT_RESOURCES"
        | "RUNTIME_MISMATCH" => StatusCode::CONFLICT,
        "AUTH_FAILED" | "AUTH_TIMEOUT" => StatusCode::UNAUTHORIZED,
        "NOT_CONNECTED" | "CONNECTION_CLOSED" | "TIMEOUT" | "BUNDLE_UNAVAILABLE"
        | "CANCELLED" => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ErrorBody::from(error))).into_response()
}
