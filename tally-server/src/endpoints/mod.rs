//! Web server endpoints.
//!
//! This module contains implementations for all supported tally endpoints.

mod flush;
mod healthcheck;
mod import;

use axum::Router;
use axum::routing::{get, post};

use crate::service::ServiceState;

/// Returns the router of the HTTP API.
pub fn routes() -> Router<ServiceState> {
    Router::new()
        .route("/api/healthcheck", get(healthcheck::handle))
        .route("/api/import", post(import::handle))
        .route("/api/flush", post(flush::handle))
}
