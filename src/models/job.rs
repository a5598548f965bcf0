use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a job. The four terminal states are absorbing: once a
/// job reaches one of them, no further status change is ever applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::Running)
    }
}

/// Submission mode, decided once at submit time and sticky for the job's
/// lifetime. It affects only how the submit call returns, never execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Sync,
    Async,
}

/// One invocation of a registered script, tracked to terminal status.
///
/// Serialized camelCase both over the wire and in the persisted job store.
/// Optional fields default on load so older store files remain readable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: Uuid,
    pub script_id: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub mode: RunMode,
    pub status: JobStatus,
    /// Terminal exit code; `None` until terminal, `-1` for non-normal
    /// termination (signal, timeout, cancel, spawn failure).
    #[serde(default)]
    pub code: Option<i32>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub stdout_ref: String,
    #[serde(default)]
    pub stderr_ref: String,
    #[serde(default)]
    pub stdout_size: u64,
    #[serde(default)]
    pub stderr_size: u64,
    #[serde(default)]
    pub stdout_truncated: bool,
    #[serde(default)]
    pub stderr_truncated: bool,
    #[serde(default)]
    pub stdout_preview: String,
    #[serde(default)]
    pub stderr_preview: String,
    /// Runtime-only cancellation mark; not part of the persisted record.
    #[serde(skip)]
    pub cancel_requested: bool,
}

impl Job {
    /// Create a new queued job. Job ids are UUIDv7, so they are unique and
    /// time-ordered within a process lifetime while staying opaque to clients.
    pub fn new(script_id: &str, args: Vec<String>, mode: RunMode) -> Self {
        let job_id = Uuid::now_v7();
        Self {
            job_id,
            script_id: script_id.to_string(),
            args,
            mode,
            status: JobStatus::Queued,
            code: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            duration_ms: None,
            stdout_ref: format!("{}.stdout.log", job_id),
            stderr_ref: format!("{}.stderr.log", job_id),
            stdout_size: 0,
            stderr_size: 0,
            stdout_truncated: false,
            stderr_truncated: false,
            stdout_preview: String::new(),
            stderr_preview: String::new(),
            cancel_requested: false,
        }
    }
}
