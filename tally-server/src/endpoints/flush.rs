//! Triggers a flush cycle outside of the regular interval.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::service::ServiceState;
use crate::services::flush::ForceFlush;

/// Runs a flush cycle and responds with its report once the batch is handed to the sinks.
pub async fn handle(State(state): State<ServiceState>) -> Response {
    match state.flush().send(ForceFlush).await {
        Ok(report) => Json(report).into_response(),
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}
