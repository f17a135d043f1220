//! Admin API handlers.
//!
//! Rotation changes take effect on the next aggregator cycle. Discovery
//! queries are answered from the bundle's discovery cache, for watched
//! services only; the watch set is fixed by config at start.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;
use tracing::info;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn not_watched(service: &str) -> axum::response::Response {
    error_response(
        &format!("service not watched: {service}"),
        StatusCode::NOT_FOUND,
    )
    .into_response()
}

#[derive(Debug, Serialize)]
pub struct RotationResponse {
    pub in_rotation: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<bool>,
}

// ── Rotation ───────────────────────────────────────────────────

/// GET /admin/rotation
pub async fn get_rotation(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(RotationResponse {
        in_rotation: state.bundle.rotation().is_in_rotation(),
        previous: None,
    })
}

/// POST /admin/rotation/oor
pub async fn out_of_rotation(State(state): State<ApiState>) -> impl IntoResponse {
    set_rotation(&state, false)
}

/// POST /admin/rotation/bir
pub async fn back_in_rotation(State(state): State<ApiState>) -> impl IntoResponse {
    set_rotation(&state, true)
}

fn set_rotation(state: &ApiState, in_rotation: bool) -> Json<ApiResponse<RotationResponse>> {
    let previous = state.bundle.rotation().set_in_rotation(in_rotation);
    info!(in_rotation, previous, "rotation set via admin api");
    ApiResponse::ok(RotationResponse {
        in_rotation,
        previous: Some(previous),
    })
}

// ── Status ─────────────────────────────────────────────────────

/// GET /admin/status
pub async fn get_status(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.bundle.status().await)
}

// ── Discovery ──────────────────────────────────────────────────

/// GET /discovery/{service}/nodes
pub async fn list_nodes(
    State(state): State<ApiState>,
    Path(service): Path<String>,
) -> impl IntoResponse {
    match state.bundle.discovery().cache(&service) {
        Some(cache) => ApiResponse::ok(cache.snapshot().as_ref().clone()).into_response(),
        None => not_watched(&service),
    }
}

/// GET /discovery/{service}/node
pub async fn get_node(
    State(state): State<ApiState>,
    Path(service): Path<String>,
) -> impl IntoResponse {
    match state.bundle.discovery().cache(&service) {
        Some(cache) => ApiResponse::ok(cache.pick()).into_response(),
        None => not_watched(&service),
    }
}
