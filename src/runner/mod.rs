pub mod executor;
pub mod scheduler;
pub mod validator;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

use crate::errors::RunnerError;
use crate::models::config::Config;
use crate::models::job::{Job, JobStatus, RunMode};
use crate::runner::executor::{ExecReport, ExitKind};
use crate::runner::scheduler::SchedState;
use crate::runner::validator::ScriptRegistry;
use crate::storage::jobs::JsonJobStore;
use crate::storage::logs::{LogPage, LogSink, LogStream};

/// A run request as the runner consumes it: already parsed, not yet validated.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub script_id: String,
    pub args: Vec<String>,
    pub mode: Option<RunMode>,
}

/// Result of a successful submit. In async mode `job` is the admission-time
/// snapshot; in sync mode it is the terminal snapshot.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub async_mode: bool,
    pub job: Job,
}

/// One page of job logs together with the job-level truncation flag.
#[derive(Debug, Clone)]
pub struct JobLogs {
    pub job_id: Uuid,
    pub stream: LogStream,
    pub truncated: bool,
    pub page: LogPage,
}

/// Handle to a running job's executor slot.
struct RunHandle {
    kill_tx: oneshot::Sender<()>,
}

/// The job runner: validates, queues, executes, supervises, and records jobs.
///
/// One logical supervisor serializes every mutation of job state, the queue,
/// and the running counter: they all happen while holding `sched`. Child I/O
/// runs in parallel per job; its results re-enter through [`finish`], which
/// takes the same lock.
#[derive(Clone)]
pub struct Runner {
    inner: Arc<RunnerInner>,
}

struct RunnerInner {
    registry: ScriptRegistry,
    default_mode: RunMode,
    store: JsonJobStore,
    sink: LogSink,
    sched: Mutex<SchedState>,
    active: Mutex<HashMap<Uuid, RunHandle>>,
    waiters: Mutex<HashMap<Uuid, Vec<oneshot::Sender<Job>>>>,
}

impl Runner {
    /// Build a runner from configuration: compile the script registry, open
    /// the job store (recovering interrupted jobs), and prepare the log sink.
    pub async fn new(config: &Config) -> Result<Self> {
        let registry = ScriptRegistry::from_specs(&config.scripts)
            .context("Failed to build script registry")?;
        let store = JsonJobStore::new(config.job_store_file())
            .await
            .context("Failed to open job store")?;
        let sink = LogSink::new(
            config.logs_dir(),
            config.runner.max_log_bytes_per_stream,
            config.runner.preview_max_bytes,
        )
        .await
        .context("Failed to prepare log sink")?;

        tracing::info!(
            "Runner ready: {} script(s), maxConcurrent={}",
            registry.len(),
            config.runner.max_concurrent
        );

        Ok(Self {
            inner: Arc::new(RunnerInner {
                registry,
                default_mode: config.runner.default_mode,
                store,
                sink,
                sched: Mutex::new(SchedState::new(config.runner.max_concurrent)),
                active: Mutex::new(HashMap::new()),
                waiters: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Validate and enqueue a run. Sync mode resolves once the job reaches a
    /// terminal state; async mode returns right after admission to the queue.
    pub async fn submit_run(&self, req: SubmitRequest) -> Result<SubmitOutcome, RunnerError> {
        let script = validator::validate(&self.inner.registry, &req.script_id, &req.args)?;
        let mode = req
            .mode
            .or(script.spec.mode)
            .unwrap_or(self.inner.default_mode);

        let job = Job::new(&req.script_id, req.args, mode);
        let job_id = job.job_id;
        tracing::info!("Job {} submitted for script '{}' ({:?})", job_id, req.script_id, mode);

        // Register the completion waiter before the job can possibly finish.
        let wait_rx = match mode {
            RunMode::Sync => {
                let (tx, rx) = oneshot::channel();
                self.inner.waiters.lock().await.entry(job_id).or_default().push(tx);
                Some(rx)
            }
            RunMode::Async => None,
        };

        {
            let mut sched = self.inner.sched.lock().await;
            self.inner.store.insert(job.clone()).await;
            sched.enqueue(job_id, req.script_id.clone());
            self.inner.drain(&mut sched).await;
        }

        match wait_rx {
            None => {
                let snapshot = self.inner.store.get(job_id).await.unwrap_or(job);
                Ok(SubmitOutcome {
                    async_mode: true,
                    job: snapshot,
                })
            }
            Some(rx) => {
                let job = match rx.await {
                    Ok(job) => job,
                    // The waiter can only be dropped on daemon shutdown;
                    // return whatever the store has at that point.
                    Err(_) => self.inner.store.get(job_id).await.unwrap_or(job),
                };
                Ok(SubmitOutcome {
                    async_mode: false,
                    job,
                })
            }
        }
    }

    /// Snapshot of one job.
    pub async fn get_job(&self, job_id: Uuid) -> Option<Job> {
        self.inner.store.get(job_id).await
    }

    /// Snapshot of all jobs, in submission order.
    pub async fn list_jobs(&self) -> Vec<Job> {
        self.inner.store.list().await
    }

    /// Random-access read of one captured stream.
    pub async fn get_job_logs(
        &self,
        job_id: Uuid,
        stream: LogStream,
        offset: u64,
        limit: u64,
    ) -> Result<JobLogs, RunnerError> {
        if limit == 0 {
            return Err(RunnerError::InvalidArgs(
                "limit must be positive".to_string(),
            ));
        }
        let job = self
            .inner
            .store
            .get(job_id)
            .await
            .ok_or_else(|| RunnerError::JobNotFound(job_id.to_string()))?;

        let (file, truncated) = match stream {
            LogStream::Stdout => (&job.stdout_ref, job.stdout_truncated),
            LogStream::Stderr => (&job.stderr_ref, job.stderr_truncated),
        };

        let page = match self.inner.sink.read_page(file, offset, limit).await {
            Ok(page) => page,
            Err(e) => {
                // Disk trouble is not the caller's problem; serve what a
                // missing file would serve and leave the details in the log.
                tracing::warn!("Log read failed for job {}: {:#}", job_id, e);
                LogPage {
                    offset,
                    next_offset: offset,
                    total_size: 0,
                    data: String::new(),
                }
            }
        };

        Ok(JobLogs {
            job_id,
            stream,
            truncated,
            page,
        })
    }

    /// Request cancellation. Idempotent: terminal jobs are returned as-is;
    /// queued jobs are marked and transition when they reach the queue head;
    /// running jobs get SIGTERM on their process group.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<Job, RunnerError> {
        let _sched = self.inner.sched.lock().await;

        let job = self
            .inner
            .store
            .get(job_id)
            .await
            .ok_or_else(|| RunnerError::JobNotFound(job_id.to_string()))?;

        if job.status.is_terminal() {
            return Ok(job);
        }

        let snapshot = self
            .inner
            .store
            .update(job_id, |j| j.cancel_requested = true)
            .await
            .unwrap_or(job);

        if snapshot.status == JobStatus::Running {
            if let Some(handle) = self.inner.active.lock().await.remove(&job_id) {
                tracing::info!("Cancelling running job {}", job_id);
                let _ = handle.kill_tx.send(());
            }
        } else {
            tracing::info!("Cancelling queued job {}", job_id);
        }

        Ok(snapshot)
    }

    /// Signal every running job's process group and mark all non-terminal
    /// jobs failed, so the persisted store is consistent before exit.
    pub async fn shutdown(&self) {
        let mut sched = self.inner.sched.lock().await;
        let handles: Vec<(Uuid, RunHandle)> =
            self.inner.active.lock().await.drain().collect();
        for (job_id, handle) in handles {
            tracing::info!("Shutting down: signalling job {}", job_id);
            let _ = handle.kill_tx.send(());
        }

        let now = Utc::now();
        for job in self.inner.store.list().await {
            if job.status.is_terminal() {
                continue;
            }
            let finished = self
                .inner
                .store
                .update(job.job_id, |j| {
                    j.status = JobStatus::Failed;
                    j.code = Some(-1);
                    j.ended_at = Some(now);
                    j.duration_ms = Some(
                        j.started_at
                            .map(|s| (now - s).num_milliseconds())
                            .unwrap_or(0),
                    );
                })
                .await;
            if let Some(snapshot) = finished {
                self.inner.notify_waiters(&snapshot).await;
            }
        }
        // Leave the queue empty so nothing starts during teardown.
        sched.clear_queue();
    }
}

impl RunnerInner {
    /// Admit queued jobs while capacity remains. Runs with the supervisor
    /// lock held; it only does bookkeeping and hands work to executor tasks,
    /// never blocking on child I/O.
    fn drain<'a>(
        self: &'a Arc<Self>,
        sched: &'a mut SchedState,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
        while let Some(entry) = sched.next_ready() {
            let Some(job) = self.store.get(entry.job_id).await else {
                continue;
            };

            // A queue entry can outlive its job's lifecycle (e.g. a shutdown
            // sweep already failed it); terminal states stay absorbing.
            if job.status.is_terminal() {
                continue;
            }

            if job.cancel_requested {
                let now = Utc::now();
                let finished = self
                    .store
                    .update(entry.job_id, |j| {
                        j.status = JobStatus::Canceled;
                        j.code = Some(-1);
                        j.ended_at = Some(now);
                        j.duration_ms = Some(0);
                    })
                    .await;
                tracing::info!("Job {} canceled before start", entry.job_id);
                if let Some(snapshot) = finished {
                    self.notify_waiters(&snapshot).await;
                }
                continue;
            }

            let Some(script) = self.registry.get(&entry.script_id) else {
                // Registry is immutable after validation, so this is
                // unreachable in practice; fail the job rather than wedge it.
                tracing::error!(
                    "Script '{}' vanished from registry; failing job {}",
                    entry.script_id,
                    entry.job_id
                );
                let now = Utc::now();
                let finished = self
                    .store
                    .update(entry.job_id, |j| {
                        j.status = JobStatus::Failed;
                        j.code = Some(-1);
                        j.ended_at = Some(now);
                        j.duration_ms = Some(0);
                    })
                    .await;
                if let Some(snapshot) = finished {
                    self.notify_waiters(&snapshot).await;
                }
                continue;
            };

            sched.job_started();
            let now = Utc::now();
            self.store
                .update(entry.job_id, |j| {
                    j.status = JobStatus::Running;
                    j.started_at = Some(now);
                })
                .await;
            tracing::info!(
                "Job {} started (script '{}', {} running)",
                entry.job_id,
                entry.script_id,
                sched.running()
            );

            let (kill_tx, kill_rx) = oneshot::channel();
            self.active
                .lock()
                .await
                .insert(entry.job_id, RunHandle { kill_tx });

            let spec = script.spec.clone();
            let writer = self.sink.open_writer(entry.job_id).await;
            let args = job.args.clone();
            let inner = Arc::clone(self);
            let job_id = entry.job_id;
            tokio::spawn(async move {
                let report = executor::run(&spec, &args, writer, kill_rx).await;
                inner.finish(job_id, report).await;
            });
        }
        })
    }

    /// Apply the terminal transition for a finished execution and admit the
    /// next queued job. The status check inside the update keeps terminal
    /// states absorbing even if the job was already finalized elsewhere.
    async fn finish(self: &Arc<Self>, job_id: Uuid, report: ExecReport) {
        let mut sched = self.sched.lock().await;
        self.active.lock().await.remove(&job_id);

        let now = Utc::now();
        let mut applied = false;
        let finished = self
            .store
            .update(job_id, |j| {
                if j.status.is_terminal() {
                    return;
                }
                applied = true;
                let (status, code) = if report.timed_out {
                    (JobStatus::TimedOut, -1)
                } else if j.cancel_requested {
                    (JobStatus::Canceled, -1)
                } else {
                    match report.exit {
                        ExitKind::Exited(0) => (JobStatus::Succeeded, 0),
                        ExitKind::Exited(code) => (JobStatus::Failed, code),
                        ExitKind::Abnormal | ExitKind::SpawnFailed => (JobStatus::Failed, -1),
                    }
                };
                j.status = status;
                j.code = Some(code);
                j.ended_at = Some(now);
                j.duration_ms = Some(
                    j.started_at
                        .map(|s| (now - s).num_milliseconds())
                        .unwrap_or(0),
                );
                j.stdout_size = report.stdout.size;
                j.stdout_truncated = report.stdout.truncated;
                j.stdout_preview = report.stdout.preview.clone();
                j.stderr_size = report.stderr.size;
                j.stderr_truncated = report.stderr.truncated;
                j.stderr_preview = report.stderr.preview.clone();
            })
            .await;

        if let Some(snapshot) = finished {
            if applied {
                tracing::info!(
                    "Job {} finished: {:?} (code {:?}, {} ms)",
                    job_id,
                    snapshot.status,
                    snapshot.code,
                    snapshot.duration_ms.unwrap_or(0)
                );
            }
            self.notify_waiters(&snapshot).await;
        }

        sched.job_finished();
        self.drain(&mut sched).await;
    }

    /// Fire all one-shot completion waiters registered for a job.
    async fn notify_waiters(&self, job: &Job) {
        if let Some(senders) = self.waiters.lock().await.remove(&job.job_id) {
            for tx in senders {
                let _ = tx.send(job.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::config::{ArgPolicy, RunnerSettings, ScriptSpec};
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, body).expect("write script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod script");
        path
    }

    fn base_config(tmp: &TempDir, scripts: Vec<ScriptSpec>) -> Config {
        Config {
            data_dir: Some(tmp.path().to_path_buf()),
            runner: RunnerSettings::default(),
            scripts,
            ..Default::default()
        }
    }

    fn echo_spec(tmp: &TempDir, id: &str, mode: Option<RunMode>) -> ScriptSpec {
        let path = write_script(
            tmp.path(),
            &format!("{}.sh", id),
            "#!/bin/bash\necho \"ran:$*\"\n",
        );
        ScriptSpec {
            id: id.to_string(),
            path,
            mode,
            timeout_sec: 0,
            args: ArgPolicy::default(),
        }
    }

    #[tokio::test]
    async fn test_submit_unknown_script_creates_no_job() {
        let tmp = TempDir::new().unwrap();
        let config = base_config(&tmp, vec![]);
        let runner = Runner::new(&config).await.expect("runner");

        let err = runner
            .submit_run(SubmitRequest {
                script_id: "ghost".to_string(),
                args: vec![],
                mode: None,
            })
            .await
            .unwrap_err();

        assert_eq!(err.code(), "SCRIPT_NOT_FOUND");
        assert!(runner.list_jobs().await.is_empty(), "no job may be created");
    }

    #[tokio::test]
    async fn test_submit_invalid_args_creates_no_job() {
        let tmp = TempDir::new().unwrap();
        let mut spec = echo_spec(&tmp, "ok", None);
        spec.args.item_pattern = Some("^[a-zA-Z0-9._-]+$".to_string());
        let config = base_config(&tmp, vec![spec]);
        let runner = Runner::new(&config).await.expect("runner");

        let err = runner
            .submit_run(SubmitRequest {
                script_id: "ok".to_string(),
                args: vec!["bad/slash".to_string()],
                mode: None,
            })
            .await
            .unwrap_err();

        assert_eq!(err.code(), "INVALID_ARGS");
        assert!(runner.list_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn test_mode_resolution_request_beats_script_beats_default() {
        let tmp = TempDir::new().unwrap();
        let config = base_config(&tmp, vec![echo_spec(&tmp, "scripted", Some(RunMode::Sync))]);
        // config default is async
        let runner = Runner::new(&config).await.expect("runner");

        // Script-level sync wins over the async default.
        let outcome = runner
            .submit_run(SubmitRequest {
                script_id: "scripted".to_string(),
                args: vec![],
                mode: None,
            })
            .await
            .expect("submit");
        assert!(!outcome.async_mode);
        assert_eq!(outcome.job.mode, RunMode::Sync);

        // Request-level async wins over the script's sync.
        let outcome = runner
            .submit_run(SubmitRequest {
                script_id: "scripted".to_string(),
                args: vec![],
                mode: Some(RunMode::Async),
            })
            .await
            .expect("submit");
        assert!(outcome.async_mode);
        assert_eq!(outcome.job.mode, RunMode::Async);
    }

    #[tokio::test]
    async fn test_sync_submit_returns_terminal_snapshot() {
        let tmp = TempDir::new().unwrap();
        let config = base_config(&tmp, vec![echo_spec(&tmp, "ok", None)]);
        let runner = Runner::new(&config).await.expect("runner");

        let outcome = runner
            .submit_run(SubmitRequest {
                script_id: "ok".to_string(),
                args: vec!["alpha".to_string()],
                mode: Some(RunMode::Sync),
            })
            .await
            .expect("submit");

        assert_eq!(outcome.job.status, JobStatus::Succeeded);
        assert_eq!(outcome.job.code, Some(0));
        assert!(outcome.job.started_at.is_some());
        assert!(outcome.job.ended_at.is_some());
        assert!(outcome.job.stdout_preview.contains("ran:alpha"));
    }

    #[tokio::test]
    async fn test_cancel_unknown_job_errors() {
        let tmp = TempDir::new().unwrap();
        let config = base_config(&tmp, vec![]);
        let runner = Runner::new(&config).await.expect("runner");

        let err = runner.cancel_job(Uuid::now_v7()).await.unwrap_err();
        assert_eq!(err.code(), "JOB_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_cancel_terminal_job_is_noop() {
        let tmp = TempDir::new().unwrap();
        let config = base_config(&tmp, vec![echo_spec(&tmp, "ok", None)]);
        let runner = Runner::new(&config).await.expect("runner");

        let outcome = runner
            .submit_run(SubmitRequest {
                script_id: "ok".to_string(),
                args: vec![],
                mode: Some(RunMode::Sync),
            })
            .await
            .expect("submit");
        let job_id = outcome.job.job_id;

        let first = runner.cancel_job(job_id).await.expect("cancel");
        let second = runner.cancel_job(job_id).await.expect("cancel again");
        assert_eq!(first.status, JobStatus::Succeeded, "terminal is absorbing");
        assert_eq!(first, second, "cancel is idempotent");
    }

    #[tokio::test]
    async fn test_logs_of_unknown_job_error() {
        let tmp = TempDir::new().unwrap();
        let config = base_config(&tmp, vec![]);
        let runner = Runner::new(&config).await.expect("runner");

        let err = runner
            .get_job_logs(Uuid::now_v7(), LogStream::Stdout, 0, 100)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "JOB_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_logs_zero_limit_rejected() {
        let tmp = TempDir::new().unwrap();
        let config = base_config(&tmp, vec![echo_spec(&tmp, "ok", None)]);
        let runner = Runner::new(&config).await.expect("runner");

        let outcome = runner
            .submit_run(SubmitRequest {
                script_id: "ok".to_string(),
                args: vec![],
                mode: Some(RunMode::Sync),
            })
            .await
            .expect("submit");

        let err = runner
            .get_job_logs(outcome.job.job_id, LogStream::Stdout, 0, 0)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGS");
    }
}
