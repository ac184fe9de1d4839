//! In-memory task store (non-persistent).

use super::{summarize, StoreError, SummaryIndex, SummaryResult, SummaryRow, TaskDb};
use crate::task::{TaskInfo, TaskState};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone, Default)]
pub struct InMemoryTaskDb {
    tasks: Arc<RwLock<BTreeMap<String, TaskInfo>>>,
}

impl InMemoryTaskDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Oldest first, ties broken by id.
    fn oldest<'a>(tasks: impl Iterator<Item = &'a TaskInfo>) -> Option<&'a TaskInfo> {
        tasks.min_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)))
    }
}

#[async_trait]
impl TaskDb for InMemoryTaskDb {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn get(&self, id: &str) -> Result<Option<TaskInfo>, StoreError> {
        Ok(self.tasks.read().await.get(id).cloned())
    }

    async fn put(&self, info: &mut TaskInfo) -> Result<bool, StoreError> {
        let mut tasks = self.tasks.write().await;
        let stored = tasks.get(&info.id).map(|t| t.version).unwrap_or(0);
        if stored != info.version {
            return Ok(false);
        }
        info.version += 1;
        tasks.insert(info.id.clone(), info.clone());
        Ok(true)
    }

    async fn erase(&self, info: &TaskInfo) -> Result<bool, StoreError> {
        let mut tasks = self.tasks.write().await;
        match tasks.get(&info.id) {
            Some(stored) if stored.version == info.version => {
                tasks.remove(&info.id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_for_profile(
        &self,
        profile: &str,
        queued: bool,
    ) -> Result<Option<TaskInfo>, StoreError> {
        let state = if queued {
            TaskState::Queued
        } else {
            TaskState::Ready
        };
        let tasks = self.tasks.read().await;
        let candidates = tasks
            .values()
            .filter(|t| t.profile == profile && t.state == state);
        Ok(Self::oldest(candidates).cloned())
    }

    async fn get_for_worker(&self, worker_id: &str) -> Result<Option<TaskInfo>, StoreError> {
        let tasks = self.tasks.read().await;
        let candidates = tasks.values().filter(|t| {
            t.state == TaskState::Running && t.worker_id.as_deref() == Some(worker_id)
        });
        Ok(Self::oldest(candidates).cloned())
    }

    async fn list_job(&self, job_id: &str) -> Result<Vec<TaskInfo>, StoreError> {
        Ok(self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn list_in_state(
        &self,
        state: TaskState,
        limit: usize,
    ) -> Result<Vec<TaskInfo>, StoreError> {
        let tasks = self.tasks.read().await;
        let mut matching: Vec<&TaskInfo> = tasks.values().filter(|t| t.state == state).collect();
        matching.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(matching.into_iter().take(limit).cloned().collect())
    }

    async fn find_range(
        &self,
        index: SummaryIndex,
        start_key: &[String],
        end_key: &[String],
        limit: Option<usize>,
        group_level: usize,
    ) -> Result<Vec<SummaryResult>, StoreError> {
        let tasks = self.tasks.read().await;
        let rows = tasks.values().map(|t| SummaryRow::from_info(index, t));
        Ok(summarize(rows, start_key, end_key, limit, group_level))
    }
}
