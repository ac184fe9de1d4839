//! Task storage module with pluggable backends.
//!
//! Supports:
//! - `memory`: In-memory storage (non-persistent, for testing)
//! - `sqlite`: SQLite database, one JSON document per node
//!
//! Every mutation goes through [`TaskDb::put`], a conditional write keyed on
//! the document's `version`. Callers read, modify and put again until the
//! put succeeds.

mod memory;
mod sqlite;

pub use memory::InMemoryTaskDb;
pub use sqlite::SqliteTaskDb;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::task::{TaskInfo, TaskState};

/// Backend failures. Write conflicts are not errors: `put` returns `false`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Aggregation views for dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryIndex {
    /// Key `[job_id, state]`
    ByJob,
    /// Key `[profile, state]`
    ByProfile,
    /// Key `[type, subtype, state]`
    ByType,
}

impl SummaryIndex {
    /// Key of `info` in this index.
    pub fn key(&self, info: &TaskInfo) -> Vec<String> {
        let state = info.state.as_str().to_string();
        match self {
            SummaryIndex::ByJob => vec![info.job_id.clone(), state],
            SummaryIndex::ByProfile => vec![info.profile.clone(), state],
            SummaryIndex::ByType => vec![info.task_type.clone(), info.subtype.clone(), state],
        }
    }
}

/// One group of a [`TaskDb::find_range`] query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryResult {
    pub key: Vec<String>,
    pub count: usize,
    /// Sum of `prev_progress + cur_progress`
    pub progress: f64,
    pub total_progress: f64,
}

/// A node reduced to what summaries need.
#[derive(Debug, Clone)]
pub(crate) struct SummaryRow {
    pub key: Vec<String>,
    pub progress: f64,
    pub total_progress: f64,
}

impl SummaryRow {
    pub(crate) fn from_info(index: SummaryIndex, info: &TaskInfo) -> Self {
        Self {
            key: index.key(info),
            progress: info.progress(),
            total_progress: info.total_progress,
        }
    }
}

/// Whether `key` lies in `[start, end]`.
///
/// Keys compare component-wise; `end` is inclusive of every key it is a
/// prefix of, so `end = ["job1"]` covers all states of `job1`.
pub(crate) fn key_in_range(key: &[String], start: &[String], end: &[String]) -> bool {
    if key < start {
        return false;
    }
    let head = &key[..key.len().min(end.len())];
    head <= end
}

/// Group `rows` within `[start, end]` by their first `group_level` key
/// components, in key order.
pub(crate) fn summarize(
    rows: impl IntoIterator<Item = SummaryRow>,
    start: &[String],
    end: &[String],
    limit: Option<usize>,
    group_level: usize,
) -> Vec<SummaryResult> {
    let mut groups: BTreeMap<Vec<String>, SummaryResult> = BTreeMap::new();
    for row in rows {
        if !key_in_range(&row.key, start, end) {
            continue;
        }
        let key: Vec<String> = row.key.into_iter().take(group_level).collect();
        let group = groups.entry(key.clone()).or_insert_with(|| SummaryResult {
            key,
            count: 0,
            progress: 0.0,
            total_progress: 0.0,
        });
        group.count += 1;
        group.progress += row.progress;
        group.total_progress += row.total_progress;
    }
    groups
        .into_values()
        .take(limit.unwrap_or(usize::MAX))
        .collect()
}

/// Task store trait - implemented by all storage backends.
#[async_trait]
pub trait TaskDb: Send + Sync {
    /// Whether this store persists data across restarts.
    fn is_persistent(&self) -> bool;

    async fn get(&self, id: &str) -> Result<Option<TaskInfo>, StoreError>;

    /// Conditionally write `info`.
    ///
    /// Succeeds only if the stored version equals `info.version` (0 for a
    /// document that must not exist yet). On success `info.version` is
    /// bumped to the stored version; on conflict nothing changes and
    /// `false` is returned.
    async fn put(&self, info: &mut TaskInfo) -> Result<bool, StoreError>;

    /// Delete `info` if its version is still current.
    async fn erase(&self, info: &TaskInfo) -> Result<bool, StoreError>;

    /// Oldest node of `profile` in `ready` (or `queued` if `queued` is set).
    async fn get_for_profile(
        &self,
        profile: &str,
        queued: bool,
    ) -> Result<Option<TaskInfo>, StoreError>;

    /// A node currently `running` under `worker_id`.
    async fn get_for_worker(&self, worker_id: &str) -> Result<Option<TaskInfo>, StoreError>;

    /// All nodes of one job, in id order.
    async fn list_job(&self, job_id: &str) -> Result<Vec<TaskInfo>, StoreError>;

    /// Up to `limit` nodes in `state`, oldest first.
    async fn list_in_state(&self, state: TaskState, limit: usize)
        -> Result<Vec<TaskInfo>, StoreError>;

    /// Aggregate nodes whose `index` key lies in `[start_key, end_key]`.
    async fn find_range(
        &self,
        index: SummaryIndex,
        start_key: &[String],
        end_key: &[String],
        limit: Option<usize>,
        group_level: usize,
    ) -> Result<Vec<SummaryResult>, StoreError>;
}

/// Which backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskDbType {
    Memory,
    #[default]
    Sqlite,
}

impl TaskDbType {
    /// Parse an environment variable value.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Some(Self::Memory),
            "sqlite" | "db" => Some(Self::Sqlite),
            _ => None,
        }
    }
}

/// Create a task store based on type and configuration.
pub async fn create_task_db(
    store_type: TaskDbType,
    data_dir: PathBuf,
) -> Result<Arc<dyn TaskDb>, StoreError> {
    match store_type {
        TaskDbType::Memory => Ok(Arc::new(InMemoryTaskDb::new())),
        TaskDbType::Sqlite => {
            let db = SqliteTaskDb::new(data_dir).await?;
            Ok(Arc::new(db))
        }
    }
}
