use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AppState;
use crate::errors::RunnerError;
use crate::models::job::{Job, RunMode};
use crate::runner::SubmitRequest;
use crate::storage::logs::LogStream;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub script_id: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub mode: Option<RunMode>,
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub ok: bool,
    #[serde(rename = "async")]
    pub async_mode: bool,
    pub job: Job,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub ok: bool,
    pub job: Job,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsResponse {
    pub ok: bool,
    pub job_id: Uuid,
    pub stream: String,
    pub offset: u64,
    pub next_offset: u64,
    pub total_size: u64,
    pub truncated: bool,
    pub data: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub ok: bool,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct LogsParams {
    pub stream: Option<String>,
    #[serde(default)]
    pub offset: u64,
    #[serde(default = "default_limit")]
    pub limit: u64,
}

fn default_limit() -> u64 {
    65536
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            ok: false,
            code: code.to_string(),
            message: message.to_string(),
        }),
    )
        .into_response()
}

fn runner_error_response(err: &RunnerError) -> Response {
    let status = match err {
        RunnerError::JobNotFound(_) => StatusCode::NOT_FOUND,
        RunnerError::ScriptNotFound(_) | RunnerError::InvalidArgs(_) => StatusCode::BAD_REQUEST,
    };
    error_response(status, err.code(), &err.to_string())
}

/// Job ids are opaque to clients; a string that is not one of ours is simply
/// an unknown job.
fn parse_job_id(raw: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(raw).map_err(|_| {
        error_response(
            StatusCode::NOT_FOUND,
            "JOB_NOT_FOUND",
            &format!("Unknown job: {}", raw),
        )
    })
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /run
pub async fn submit_run(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RunRequest>,
) -> Response {
    let result = state
        .runner
        .submit_run(SubmitRequest {
            script_id: req.script_id,
            args: req.args,
            mode: req.mode,
        })
        .await;

    match result {
        Ok(outcome) => {
            let status = if outcome.async_mode {
                StatusCode::ACCEPTED
            } else {
                StatusCode::OK
            };
            (
                status,
                Json(RunResponse {
                    ok: true,
                    async_mode: outcome.async_mode,
                    job: outcome.job,
                }),
            )
                .into_response()
        }
        Err(e) => {
            tracing::warn!("Run rejected: {}", e);
            runner_error_response(&e)
        }
    }
}

/// GET /jobs/{id}
pub async fn get_job(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let job_id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.runner.get_job(job_id).await {
        Some(job) => (StatusCode::OK, Json(job)).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            "JOB_NOT_FOUND",
            &format!("Unknown job: {}", id),
        ),
    }
}

/// GET /jobs/{id}/logs?stream=&offset=&limit=
pub async fn get_job_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<LogsParams>,
) -> Response {
    let job_id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let stream = match params.stream.as_deref() {
        None => LogStream::Stdout,
        Some(raw) => match LogStream::parse(raw) {
            Some(s) => s,
            None => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "INVALID_ARGS",
                    &format!("stream must be 'stdout' or 'stderr', got '{}'", raw),
                );
            }
        },
    };

    match state
        .runner
        .get_job_logs(job_id, stream, params.offset, params.limit)
        .await
    {
        Ok(logs) => (
            StatusCode::OK,
            Json(LogsResponse {
                ok: true,
                job_id: logs.job_id,
                stream: logs.stream.as_str().to_string(),
                offset: logs.page.offset,
                next_offset: logs.page.next_offset,
                total_size: logs.page.total_size,
                truncated: logs.truncated,
                data: logs.page.data,
            }),
        )
            .into_response(),
        Err(e) => runner_error_response(&e),
    }
}

/// POST /jobs/{id}/cancel
pub async fn cancel_job(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let job_id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.runner.cancel_job(job_id).await {
        Ok(job) => (StatusCode::OK, Json(CancelResponse { ok: true, job })).into_response(),
        Err(e) => runner_error_response(&e),
    }
}

/// Fallback for unknown routes, kept in the same JSON error shape.
pub async fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "NOT_FOUND", "No such route")
}
