use thiserror::Error;

/// Errors surfaced to API callers. Execution failures, timeouts, and
/// cancellations are job states, not errors, and never appear here.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Unknown script: {0}")]
    ScriptNotFound(String),

    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("Unknown job: {0}")]
    JobNotFound(String),
}

impl RunnerError {
    /// Stable wire code for this error, as reported in JSON responses.
    pub fn code(&self) -> &'static str {
        match self {
            RunnerError::ScriptNotFound(_) => "SCRIPT_NOT_FOUND",
            RunnerError::InvalidArgs(_) => "INVALID_ARGS",
            RunnerError::JobNotFound(_) => "JOB_NOT_FOUND",
        }
    }
}
