//! Receives metrics forwarded by other agents in global mode.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use tally_metrics::Metric;

use crate::service::ServiceState;

pub async fn handle(
    State(state): State<ServiceState>,
    Json(metrics): Json<Vec<Metric>>,
) -> StatusCode {
    tally_log::trace!("importing {} metrics", metrics.len());
    state.ingestor().import(metrics).await;
    StatusCode::ACCEPTED
}
