//! A simple health check endpoint for tally.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;

use crate::service::ServiceState;

#[derive(Debug, Serialize)]
struct Status {
    is_healthy: bool,
}

/// Reports the agent as healthy until a shutdown is initiated.
pub async fn handle(State(state): State<ServiceState>) -> impl IntoResponse {
    if state.is_shutting_down() {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(Status { is_healthy: false }),
        )
    } else {
        (StatusCode::OK, Json(Status { is_healthy: true }))
    }
}
