//! Tree maintenance: everything that touches more than one node.
//!
//! Child nodes are created by the worker that applied the parent's result,
//! and a parent is woken by the worker that finished its last child. Both
//! are plain conditional writes, so a crash in between leaves a state any
//! other worker can complete:
//! - a parent stuck in `adding_children` is picked up by
//!   [`TaskWorker::recover_adding_children`] before every claim
//! - a `pending` parent with a `done` child missing from its slots is woken
//!   by [`TaskWorker::recover_pending_parents`] when the queue runs dry
//! - child creation is create-if-absent, so running it twice is harmless
//! - a child's output is recorded into its parent's slot at most once

use super::{TaskWorker, WorkerError};
use crate::store::SummaryIndex;
use crate::task::{child_id, TaskInfo, TaskState};

/// Parents recovered per claim.
const RECOVERY_BATCH: usize = 64;

impl TaskWorker {
    /// Read-modify-write `id` until the write lands.
    ///
    /// `f` returns `false` to leave the node as it is. Returns the node as
    /// last seen, or `None` if it does not exist.
    pub(crate) async fn modify<F>(&self, id: &str, mut f: F) -> Result<Option<TaskInfo>, WorkerError>
    where
        F: FnMut(&mut TaskInfo) -> bool + Send,
    {
        loop {
            let Some(mut info) = self.db.get(id).await? else {
                return Ok(None);
            };
            if !f(&mut info) {
                return Ok(Some(info));
            }
            if self.db.put(&mut info).await? {
                return Ok(Some(info));
            }
            tracing::debug!("Conflict writing {}; retrying", id);
        }
    }

    /// Create a new job from a task type and its initial state.
    ///
    /// The state is validated by loading it into a fresh task, which also
    /// supplies the job's requirements and subtype. Returns the job id.
    pub async fn submit_job(
        &self,
        task_type: &str,
        user: &str,
        state: Vec<u8>,
    ) -> Result<String, WorkerError> {
        let mut task = self
            .registry
            .create_task(task_type)
            .ok_or_else(|| WorkerError::UnknownTaskType(task_type.to_string()))?;
        task.load_state(&state)
            .map_err(|source| WorkerError::InvalidState {
                task_type: task_type.to_string(),
                source,
            })?;
        let requirements = task.requirements();

        let job_id = uuid::Uuid::new_v4().simple().to_string();
        let storage = crate::blob::BlobPath::new("jobs").append(&job_id);
        let state_path = storage.unique("state");
        self.blobs.put(&state_path, state).await?;

        let mut info = TaskInfo::new_job(
            &job_id,
            task_type,
            user,
            self.config.profile_for(&requirements),
            requirements,
            task.subtype(),
            storage,
            state_path,
        );
        self.db.put(&mut info).await?;
        tracing::info!(
            "Submitted job {} (type {}, profile {}) for {}",
            job_id,
            task_type,
            info.profile,
            user
        );
        Ok(job_id)
    }

    /// Materialise the children of `parent`'s latest step and move it to
    /// `pending` (or straight to `ready` if they have all finished already).
    pub async fn add_children(&self, parent: &TaskInfo) -> Result<(), WorkerError> {
        let weight = parent.child_weight();
        for def in parent.latest_subtasks() {
            let profile = self.config.profile_for(&def.requirements);
            let mut child = TaskInfo::new_child(parent, def, weight, profile);
            if !self.db.put(&mut child).await? {
                tracing::debug!("Child {} already exists", child.id);
            }
        }

        let step = parent.step;
        let updated = self
            .modify(&parent.id, |info| {
                if info.state != TaskState::AddingChildren || info.step != step {
                    return false;
                }
                info.state = if info.subtasks_pending == 0 {
                    TaskState::Ready
                } else {
                    TaskState::Pending
                };
                true
            })
            .await?;
        if let Some(info) = updated {
            tracing::info!(
                "Task {} waiting on {} children ({})",
                info.id,
                info.subtasks_pending,
                info.state
            );
        }
        Ok(())
    }

    /// Finish child creation for parents a crashed worker left behind.
    pub async fn recover_adding_children(&self) -> Result<usize, WorkerError> {
        let stuck = self
            .db
            .list_in_state(TaskState::AddingChildren, RECOVERY_BATCH)
            .await?;
        for parent in &stuck {
            tracing::info!("Recovering children of {}", parent.id);
            self.add_children(parent).await?;
        }
        Ok(stuck.len())
    }

    /// Record outputs of `done` children that never reached their `pending`
    /// parent, after a worker died (or its store write failed) between the
    /// child's completion and [`TaskWorker::notify_parent`].
    ///
    /// Returns how many outputs were recorded.
    pub async fn recover_pending_parents(&self) -> Result<usize, WorkerError> {
        let waiting = self
            .db
            .list_in_state(TaskState::Pending, usize::MAX)
            .await?;
        let mut recorded = 0;
        for parent in &waiting {
            for (subtask_id, slot) in parent.subtask_outputs.iter().enumerate() {
                if slot.is_some() {
                    continue;
                }
                let Some(child) = self.db.get(&child_id(&parent.id, subtask_id)).await? else {
                    continue;
                };
                if child.state != TaskState::Done || child.output_path.is_none() {
                    continue;
                }
                tracing::info!("Recovering completion of {} for {}", child.id, parent.id);
                self.notify_parent(&child).await?;
                recorded += 1;
            }
        }
        Ok(recorded)
    }

    /// Record a finished child's output in its parent, waking the parent
    /// when it was the last one outstanding.
    pub async fn notify_parent(&self, child: &TaskInfo) -> Result<(), WorkerError> {
        let (Some(parent_id), Some(subtask_id)) = (&child.parent_id, child.subtask_id) else {
            return Ok(());
        };
        let Some(output_path) = child.output_path.clone() else {
            tracing::warn!("Child {} finished without an output", child.id);
            return Ok(());
        };

        let parent = self
            .modify(parent_id, |info| {
                info.record_child_output(subtask_id, output_path.clone())
            })
            .await?;
        match parent {
            Some(parent) if parent.state == TaskState::Ready => {
                tracing::info!("All children of {} done; it is ready again", parent.id);
            }
            Some(_) => {}
            None => tracing::warn!("Parent {} of {} is gone", parent_id, child.id),
        }
        Ok(())
    }

    /// Completion of a job: `prev_progress + cur_progress` summed over all
    /// of its nodes.
    pub async fn job_progress(&self, job_id: &str) -> Result<f64, WorkerError> {
        let key = vec![job_id.to_string()];
        let summary = self
            .db
            .find_range(SummaryIndex::ByJob, &key, &key, None, 1)
            .await?;
        summary
            .first()
            .map(|group| group.progress)
            .ok_or_else(|| WorkerError::NotFound(job_id.to_string()))
    }

    /// Cancel every unfinished node of a job.
    ///
    /// The root records `reason`, also when it is already `cancelled` (a
    /// root that ran out of retries gets there before the job is cancelled).
    /// Returns `false` if the job had already completed.
    pub async fn cancel_job(&self, job_id: &str, reason: &str) -> Result<bool, WorkerError> {
        let root = self
            .modify(job_id, |info| {
                if info.state == TaskState::Done {
                    return false;
                }
                info.state = TaskState::Canceling;
                info.error = Some(reason.to_string());
                true
            })
            .await?
            .ok_or_else(|| WorkerError::NotFound(job_id.to_string()))?;
        if root.state == TaskState::Done {
            return Ok(false);
        }

        let nodes = self.db.list_job(job_id).await?;
        let mut cancelled = 0usize;
        for node in nodes.iter().filter(|n| n.id != job_id) {
            self.modify(&node.id, |info| {
                if info.state.is_terminal() {
                    return false;
                }
                info.state = TaskState::Cancelled;
                info.worker_id = None;
                if info.error.is_none() {
                    info.error = Some(reason.to_string());
                }
                cancelled += 1;
                true
            })
            .await?;
        }

        self.modify(job_id, |info| {
            if info.state != TaskState::Canceling {
                return false;
            }
            info.state = TaskState::Cancelled;
            info.worker_id = None;
            true
        })
        .await?;
        tracing::warn!("Cancelled job {} ({} nodes): {}", job_id, cancelled, reason);
        Ok(true)
    }

    /// Remove every node of a job. Blobs are write-once and stay behind.
    pub async fn erase_job(&self, job_id: &str) -> Result<usize, WorkerError> {
        self.modify(job_id, |info| {
            info.state = TaskState::Erasing;
            true
        })
        .await?
        .ok_or_else(|| WorkerError::NotFound(job_id.to_string()))?;

        let mut nodes = self.db.list_job(job_id).await?;
        // Root last, so an interrupted erase can be resumed by job id
        nodes.sort_by_key(|n| n.id == job_id);

        let mut erased = 0;
        for node in nodes {
            let mut current = Some(node);
            while let Some(info) = current {
                if self.db.erase(&info).await? {
                    erased += 1;
                    break;
                }
                current = self.db.get(&info.id).await?;
            }
        }
        tracing::info!("Erased job {} ({} nodes)", job_id, erased);
        Ok(erased)
    }

    /// Bring a cancelled job back to life.
    ///
    /// Cancelled nodes still waiting on children go through child creation
    /// again (it is idempotent), the rest become `ready`. Retry counters
    /// start over.
    pub async fn resurrect_job(&self, job_id: &str) -> Result<usize, WorkerError> {
        let root = self
            .db
            .get(job_id)
            .await?
            .ok_or_else(|| WorkerError::NotFound(job_id.to_string()))?;
        if root.state != TaskState::Cancelled {
            return Err(WorkerError::InvalidJobState {
                job_id: job_id.to_string(),
                state: root.state,
                expected: TaskState::Cancelled,
            });
        }
        self.modify(job_id, |info| {
            if info.state != TaskState::Cancelled {
                return false;
            }
            info.state = TaskState::Resurrect;
            true
        })
        .await?;

        let mut nodes = self.db.list_job(job_id).await?;
        nodes.sort_by_key(|n| n.id == job_id);

        let mut revived = Vec::new();
        for node in nodes {
            let updated = self
                .modify(&node.id, |info| {
                    if !matches!(info.state, TaskState::Cancelled | TaskState::Resurrect) {
                        return false;
                    }
                    info.state = if info.subtasks_pending > 0 {
                        TaskState::AddingChildren
                    } else {
                        TaskState::Ready
                    };
                    info.error_count = 0;
                    info.error = None;
                    true
                })
                .await?;
            if let Some(info) = updated {
                if matches!(info.state, TaskState::AddingChildren | TaskState::Ready) {
                    revived.push(info);
                }
            }
        }

        for info in revived.iter().filter(|i| i.state == TaskState::AddingChildren) {
            self.add_children(info).await?;
        }
        tracing::info!("Resurrected job {} ({} nodes)", job_id, revived.len());
        Ok(revived.len())
    }
}
