use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use super::AppState;
use crate::models::job::JobStatus;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub jobs_total: usize,
    pub jobs_running: usize,
    pub jobs_queued: usize,
    pub scripts_registered: usize,
    pub version: String,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::debug!("Health check");

    let jobs = state.runner.list_jobs().await;
    let running = jobs
        .iter()
        .filter(|j| j.status == JobStatus::Running)
        .count();
    let queued = jobs
        .iter()
        .filter(|j| j.status == JobStatus::Queued)
        .count();

    let response = HealthResponse {
        status: "ok".to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        jobs_total: jobs.len(),
        jobs_running: running,
        jobs_queued: queued,
        scripts_registered: state.config.scripts.len(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    (StatusCode::OK, Json(response))
}
