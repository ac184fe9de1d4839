//! Configuration management for tasktree workers.
//!
//! Configuration can be set via environment variables:
//! - `TASKTREE_UPDATE_INTERVAL` - Optional. Heartbeat cadence in seconds. Defaults to `10`.
//! - `TASKTREE_TASK_TIMEOUT` - Optional. Task timeout in seconds; heartbeat backoff is capped at half of it. Defaults to `3600`.
//! - `TASKTREE_MAX_ERRORS` - Optional. Retries per node before the job is cancelled. Defaults to `5`.
//! - `TASKTREE_NO_RETRY_PROFILES` - Optional. Comma-separated profiles with no retries. Defaults to `himem`.
//! - `TASKTREE_HIMEM_MB` - Optional. Memory requirement above which a task runs in the `himem` profile. Defaults to `16384`.
//! - `TASKTREE_FAIL_FAST_INVARIANT` - Optional. Cancel on the first invariant violation. Defaults to `false`.
//! - `TASKTREE_STORE` - Optional. `memory` or `sqlite`. Defaults to `sqlite`.
//! - `TASKTREE_DATA_DIR` - Optional. Database and blob directory. Defaults to `./tasktree-data`.
//! - `TASKTREE_PROFILE` - Optional. Profile this worker serves. Defaults to `normal`.
//! - `TASKTREE_WORKER_ID` - Optional. Stable worker identity. Defaults to `worker-<uuid>`.
//! - `TASKTREE_QUEUED` - Optional. Claim `queued` instead of `ready` nodes. Defaults to `false`.
//! - `TASKTREE_POLL_INTERVAL` - Optional. Seconds between polls of an empty queue; `0` exits instead. Defaults to `0`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::store::TaskDbType;
use crate::task::NORMAL_PROFILE;
use crate::worker::{LoopOptions, WorkerConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Worker process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Scheduling knobs shared by every worker
    pub worker: WorkerConfig,

    /// Storage backend
    pub store: TaskDbType,

    /// Directory holding the database and the blob tree
    pub data_dir: PathBuf,

    /// Profile this worker claims from
    pub profile: String,

    pub worker_id: String,

    /// Claim `queued` nodes instead of `ready` ones
    pub queued: bool,

    /// Sleep between polls of an empty queue; `None` exits instead
    pub poll_interval: Option<Duration>,
}

fn parse_var<T>(name: &str, value: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        None => Ok(default),
    }
}

fn parse_bool(name: &str, value: Option<String>, default: bool) -> Result<bool, ConfigError> {
    match value {
        Some(value) => match value.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "y" | "on" => Ok(true),
            "0" | "false" | "no" | "n" | "off" | "" => Ok(false),
            other => Err(ConfigError::InvalidValue(
                name.to_string(),
                format!("expected a boolean, got {:?}", other),
            )),
        },
        None => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable is set but cannot be
    /// parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup` instead of the process
    /// environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = WorkerConfig::default();

        let update_interval = parse_var(
            "TASKTREE_UPDATE_INTERVAL",
            lookup("TASKTREE_UPDATE_INTERVAL"),
            defaults.update_interval.as_secs(),
        )?;
        let task_timeout = parse_var(
            "TASKTREE_TASK_TIMEOUT",
            lookup("TASKTREE_TASK_TIMEOUT"),
            defaults.task_timeout.as_secs(),
        )?;
        let max_errors = parse_var(
            "TASKTREE_MAX_ERRORS",
            lookup("TASKTREE_MAX_ERRORS"),
            defaults.max_errors,
        )?;
        let no_retry_profiles = match lookup("TASKTREE_NO_RETRY_PROFILES") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
            None => defaults.no_retry_profiles,
        };
        let himem_threshold_mb = parse_var(
            "TASKTREE_HIMEM_MB",
            lookup("TASKTREE_HIMEM_MB"),
            defaults.himem_threshold_mb,
        )?;
        let fail_fast_invariant = parse_bool(
            "TASKTREE_FAIL_FAST_INVARIANT",
            lookup("TASKTREE_FAIL_FAST_INVARIANT"),
            defaults.fail_fast_invariant,
        )?;

        let store = match lookup("TASKTREE_STORE") {
            Some(value) => TaskDbType::parse(&value).ok_or_else(|| {
                ConfigError::InvalidValue(
                    "TASKTREE_STORE".to_string(),
                    format!("unknown store {:?}, expected memory or sqlite", value),
                )
            })?,
            None => TaskDbType::default(),
        };
        let data_dir = lookup("TASKTREE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./tasktree-data"));
        let profile = lookup("TASKTREE_PROFILE").unwrap_or_else(|| NORMAL_PROFILE.to_string());
        let worker_id = lookup("TASKTREE_WORKER_ID")
            .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4().simple()));
        let queued = parse_bool("TASKTREE_QUEUED", lookup("TASKTREE_QUEUED"), false)?;
        let poll_secs: u64 = parse_var(
            "TASKTREE_POLL_INTERVAL",
            lookup("TASKTREE_POLL_INTERVAL"),
            0,
        )?;

        if update_interval == 0 {
            return Err(ConfigError::InvalidValue(
                "TASKTREE_UPDATE_INTERVAL".to_string(),
                "must be at least 1 second".to_string(),
            ));
        }

        Ok(Self {
            worker: WorkerConfig {
                update_interval: Duration::from_secs(update_interval),
                task_timeout: Duration::from_secs(task_timeout),
                max_errors,
                no_retry_profiles,
                himem_threshold_mb,
                fail_fast_invariant,
            },
            store,
            data_dir,
            profile,
            worker_id,
            queued,
            poll_interval: (poll_secs > 0).then(|| Duration::from_secs(poll_secs)),
        })
    }

    /// Create a config with default values rooted at `data_dir` (useful for
    /// testing).
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            worker: WorkerConfig::default(),
            store: TaskDbType::default(),
            data_dir,
            profile: NORMAL_PROFILE.to_string(),
            worker_id: format!("worker-{}", uuid::Uuid::new_v4().simple()),
            queued: false,
            poll_interval: None,
        }
    }

    /// Where the blob tree lives.
    pub fn blob_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }

    pub fn worker_config(&self) -> WorkerConfig {
        self.worker.clone()
    }

    pub fn loop_options(&self) -> LoopOptions {
        LoopOptions {
            profile: self.profile.clone(),
            queued: self.queued,
            poll_interval: self.poll_interval,
        }
    }
}
