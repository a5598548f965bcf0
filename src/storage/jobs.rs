use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::job::{Job, JobStatus};

/// Durable job store: an in-memory cache mirrored to a single JSON file.
///
/// Every insert and update rewrites the whole file through a temp-and-rename
/// so readers never observe a torn write. Persistence is best-effort: a
/// failed write is logged and the in-memory state stays authoritative until
/// the next transition retries it.
pub struct JsonJobStore {
    file_path: PathBuf,
    cache: RwLock<Vec<Job>>,
}

impl JsonJobStore {
    /// Open the store, loading existing records from disk if present.
    ///
    /// Records found in a non-terminal state belong to a previous process
    /// that never witnessed their completion; they are recovered as `failed`
    /// with `code = -1`. A corrupted file is backed up to `<file>.bak` and
    /// the store starts empty.
    pub async fn new(file_path: PathBuf) -> Result<Self> {
        if let Some(parent) = file_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create job store directory")?;
        }

        let mut jobs = if file_path.exists() {
            let content = tokio::fs::read_to_string(&file_path)
                .await
                .context("Failed to read job store file")?;
            match serde_json::from_str::<Vec<Job>>(&content) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::warn!(
                        "Job store file is corrupted ({}), creating backup and starting empty",
                        e
                    );
                    let backup_path = file_path.with_extension("json.bak");
                    if let Err(backup_err) = tokio::fs::copy(&file_path, &backup_path).await {
                        tracing::error!(
                            "Failed to back up corrupted job store: {}",
                            backup_err
                        );
                    }
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let now = Utc::now();
        let mut recovered = 0usize;
        for job in &mut jobs {
            if !job.status.is_terminal() {
                job.status = JobStatus::Failed;
                job.code = Some(-1);
                job.ended_at = Some(now);
                job.duration_ms = Some(
                    job.started_at
                        .map(|s| (now - s).num_milliseconds())
                        .unwrap_or(0),
                );
                recovered += 1;
            }
        }

        let store = Self {
            file_path,
            cache: RwLock::new(jobs),
        };

        if recovered > 0 {
            tracing::warn!(
                "Recovered {} interrupted job(s) from a previous run as failed",
                recovered
            );
            let cache = store.cache.read().await;
            store.persist(&cache).await;
        }

        Ok(store)
    }

    /// Atomically rewrite the backing file from the given snapshot.
    async fn try_persist(&self, jobs: &[Job]) -> Result<()> {
        let tmp_path = self.file_path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(jobs).context("Failed to serialize jobs")?;
        tokio::fs::write(&tmp_path, json.as_bytes())
            .await
            .context("Failed to write temporary job store file")?;
        tokio::fs::rename(&tmp_path, &self.file_path)
            .await
            .context("Failed to rename temporary job store file")?;
        Ok(())
    }

    /// Best-effort persist: failures are logged, never propagated.
    async fn persist(&self, jobs: &[Job]) {
        if let Err(e) = self.try_persist(jobs).await {
            tracing::error!("Failed to persist job store: {:#}", e);
        }
    }

    /// Add a new job and mirror the store to disk.
    pub async fn insert(&self, job: Job) {
        let mut cache = self.cache.write().await;
        cache.push(job);
        self.persist(&cache).await;
    }

    /// Mutate a job in place, mirror to disk, and return the new snapshot.
    /// Returns `None` if the job id is unknown.
    pub async fn update(&self, job_id: Uuid, mutate: impl FnOnce(&mut Job)) -> Option<Job> {
        let mut cache = self.cache.write().await;
        let job = cache.iter_mut().find(|j| j.job_id == job_id)?;
        mutate(job);
        let snapshot = job.clone();
        self.persist(&cache).await;
        Some(snapshot)
    }

    /// Defensive copy of a job, if known.
    pub async fn get(&self, job_id: Uuid) -> Option<Job> {
        let cache = self.cache.read().await;
        cache.iter().find(|j| j.job_id == job_id).cloned()
    }

    /// Snapshot of every known job, in insertion order.
    pub async fn list(&self) -> Vec<Job> {
        self.cache.read().await.clone()
    }
}
