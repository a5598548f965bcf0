pub mod health;
pub mod routes;

use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, post};
use axum::Router;

use crate::models::config::Config;
use crate::runner::Runner;

/// Shared application state for the Axum server.
pub struct AppState {
    pub runner: Runner,
    pub config: Arc<Config>,
    pub start_time: Instant,
}

/// Create the Axum router with all routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/run", post(routes::submit_run))
        .route("/jobs/{id}", get(routes::get_job))
        .route("/jobs/{id}/logs", get(routes::get_job_logs))
        .route("/jobs/{id}/cancel", post(routes::cancel_job))
        .route("/healthz", get(health::health_check))
        .fallback(routes::not_found)
        .with_state(state)
}
