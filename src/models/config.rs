use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::job::RunMode;

/// Top-level daemon configuration, loaded once at startup and immutable
/// afterwards. Every field has a default so a partial (or absent) config file
/// still yields a working daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub runner: RunnerSettings,
    #[serde(default)]
    pub scripts: Vec<ScriptSpec>,
}

/// Knobs the job runner reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerSettings {
    /// Admission ceiling: at most this many jobs run concurrently.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Mode used when neither the request nor the script specifies one.
    #[serde(default = "default_mode")]
    pub default_mode: RunMode,
    /// Per-stream log cap in bytes. Output beyond the cap is discarded and
    /// the stream is flagged truncated.
    #[serde(default = "default_max_log_bytes")]
    pub max_log_bytes_per_stream: u64,
    /// Size of the in-memory tail kept for job previews.
    #[serde(default = "default_preview_max_bytes")]
    pub preview_max_bytes: usize,
    /// Path of the JSON job store; defaults to `<dataDir>/jobs.json`.
    #[serde(default)]
    pub job_store_file: Option<PathBuf>,
    /// Directory for per-job log files; defaults to `<dataDir>/logs`.
    #[serde(default)]
    pub logs_dir: Option<PathBuf>,
}

/// One pre-registered script: the only things this daemon will ever execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptSpec {
    pub id: String,
    pub path: PathBuf,
    /// Default mode for runs of this script; request-level mode wins.
    #[serde(default)]
    pub mode: Option<RunMode>,
    /// Wall-clock limit in seconds; 0 disables the timer.
    #[serde(default)]
    pub timeout_sec: u64,
    #[serde(default)]
    pub args: ArgPolicy,
}

/// Constraints applied to the argument vector of a run request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArgPolicy {
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    /// Regular expression each argument must match, applied exactly as
    /// written (no implicit anchoring). `None` accepts any string.
    #[serde(default)]
    pub item_pattern: Option<String>,
    #[serde(default = "default_item_max_length")]
    pub item_max_length: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8311
}

fn default_max_concurrent() -> usize {
    2
}

fn default_mode() -> RunMode {
    RunMode::Async
}

fn default_max_log_bytes() -> u64 {
    1_048_576 // 1 MiB
}

fn default_preview_max_bytes() -> usize {
    4096
}

fn default_max_items() -> usize {
    16
}

fn default_item_max_length() -> usize {
    256
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: None,
            runner: RunnerSettings::default(),
            scripts: Vec::new(),
        }
    }
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            default_mode: default_mode(),
            max_log_bytes_per_stream: default_max_log_bytes(),
            preview_max_bytes: default_preview_max_bytes(),
            job_store_file: None,
            logs_dir: None,
        }
    }
}

impl Default for ArgPolicy {
    fn default() -> Self {
        Self {
            max_items: default_max_items(),
            item_pattern: None,
            item_max_length: default_item_max_length(),
        }
    }
}

impl Config {
    /// Effective data directory: explicit config value or the platform default.
    pub fn data_dir(&self) -> PathBuf {
        match &self.data_dir {
            Some(d) => d.clone(),
            None => resolve_data_dir(None),
        }
    }

    /// Effective job store path.
    pub fn job_store_file(&self) -> PathBuf {
        match &self.runner.job_store_file {
            Some(p) => p.clone(),
            None => self.data_dir().join("jobs.json"),
        }
    }

    /// Effective log directory.
    pub fn logs_dir(&self) -> PathBuf {
        match &self.runner.logs_dir {
            Some(p) => p.clone(),
            None => self.data_dir().join("logs"),
        }
    }
}

/// Load the configuration using the resolution order:
///   1. explicit `--config` path (error if missing)
///   2. `RUNBOOKD_CONFIG` environment variable
///   3. `<data-dir>/config.json`
///   4. built-in defaults
pub fn load_config(config_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = config_path {
        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }
        let content = std::fs::read_to_string(path).context("Failed to read config file")?;
        let config: Config =
            serde_json::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.display());
        return Ok(config);
    }

    if let Ok(env_path) = std::env::var("RUNBOOKD_CONFIG") {
        let path = PathBuf::from(&env_path);
        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .context("Failed to read config from RUNBOOKD_CONFIG")?;
            let config: Config = serde_json::from_str(&content)
                .context("Failed to parse config from RUNBOOKD_CONFIG")?;
            tracing::info!("Loaded config from RUNBOOKD_CONFIG: {}", path.display());
            return Ok(config);
        }
    }

    let default_path = resolve_data_dir(None).join("config.json");
    if default_path.exists() {
        let content =
            std::fs::read_to_string(&default_path).context("Failed to read config file")?;
        let config: Config =
            serde_json::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", default_path.display());
        return Ok(config);
    }

    tracing::info!("No config file found, using defaults");
    Ok(Config::default())
}

/// Resolve the data directory: explicit override, `RUNBOOKD_DATA_DIR`, or the
/// platform data dir (`~/.local/share/runbookd` on Linux).
pub fn resolve_data_dir(override_dir: Option<&Path>) -> PathBuf {
    if let Some(dir) = override_dir {
        return dir.to_path_buf();
    }
    if let Ok(d) = std::env::var("RUNBOOKD_DATA_DIR") {
        return PathBuf::from(d);
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("runbookd")
}

/// Create the data and log directories if they do not exist yet.
pub async fn create_data_dirs(config: &Config) -> Result<()> {
    tokio::fs::create_dir_all(config.data_dir())
        .await
        .context("Failed to create data directory")?;
    tokio::fs::create_dir_all(config.logs_dir())
        .await
        .context("Failed to create logs directory")?;
    Ok(())
}
