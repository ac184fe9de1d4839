//! Persistent record for one node of a job's task tree.
//!
//! # Progress accounting
//! Every node owns a weight `total_progress` handed to it by its parent
//! (1.0 for the top-level task). Each step splits what is left of that
//! weight three ways:
//!
//! ```text
//! remaining ──┬── cur_part    -> folded into prev_progress
//!             ├── future_part -> stays in remaining_progress
//!             └── the rest    -> progress_children (split among subtasks)
//! ```
//!
//! # Invariants
//! - `prev_progress + cur_progress <= total_progress`
//! - `remaining_progress` only ever shrinks, by a factor of `future_part`
//!   per step
//! - children of one step receive at most `progress_children` in total
//! - summing `prev_progress + cur_progress` over all nodes of a job gives
//!   the job's completion, which reaches 1.0 when every node is done

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::attempt::{AttemptOutcome, SubtaskDefinition, TaskAttempt, TaskAttemptResult};
use super::error::ErrorKind;
use super::task::Requirements;
use crate::blob::BlobPath;

/// Lifecycle state of a task node.
///
/// # State Machine
/// ```text
/// ready/queued -> running -> ready            (error, retries left)
///                        \-> cancelled        (error, retries exhausted)
///                        \-> ready            (new, no subtasks)
///                        \-> adding_children -> pending -> ready
///                        \-> done
/// job-wide: canceling -> cancelled -> resurrect -> ready/pending
///           erasing   -> (removed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Erasing,
    Canceling,
    AddingChildren,
    Ready,
    Queued,
    Running,
    Pending,
    Cancelled,
    Done,
    Resurrect,
    /// Sentinel upper bound; never stored
    Invalid,
}

impl TaskState {
    pub const ALL: [TaskState; 11] = [
        TaskState::Erasing,
        TaskState::Canceling,
        TaskState::AddingChildren,
        TaskState::Ready,
        TaskState::Queued,
        TaskState::Running,
        TaskState::Pending,
        TaskState::Cancelled,
        TaskState::Done,
        TaskState::Resurrect,
        TaskState::Invalid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Erasing => "erasing",
            TaskState::Canceling => "canceling",
            TaskState::AddingChildren => "adding_children",
            TaskState::Ready => "ready",
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Pending => "pending",
            TaskState::Cancelled => "cancelled",
            TaskState::Done => "done",
            TaskState::Resurrect => "resurrect",
            TaskState::Invalid => "invalid",
        }
    }

    /// `true` for states no worker will move the node out of on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::Cancelled)
    }

    /// `true` for states a worker may claim from.
    pub fn is_claimable(&self) -> bool {
        matches!(self, TaskState::Ready | TaskState::Queued)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskState::ALL
            .iter()
            .find(|state| state.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown task state: {}", s))
    }
}

/// What an `error` result did to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Back to `ready` for another attempt
    Retry,
    /// Out of retries; the whole job must be cancelled
    Exhausted,
}

/// Durable tree node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    /// `<job_id>` for the top-level task, `<parent_id>_<subtask_id>` below it
    #[serde(rename = "_id")]
    pub id: String,
    /// Store revision; 0 means never written
    #[serde(rename = "_rev", default)]
    pub version: u64,
    pub job_id: String,
    pub parent_id: Option<String>,
    pub subtask_id: Option<usize>,
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub subtype: String,
    pub user: String,
    pub profile: String,
    pub requirements: Requirements,

    pub state: TaskState,
    pub step: u64,
    pub error_count: u32,
    pub error: Option<String>,
    pub worker_id: Option<String>,

    pub total_progress: f64,
    pub remaining_progress: f64,
    pub prev_progress: f64,
    pub cur_progress: f64,
    pub progress_children: f64,

    pub storage: BlobPath,
    pub state_path: BlobPath,
    pub output_path: Option<BlobPath>,
    pub subtasks_pending: usize,
    /// Children created by the most recent step
    #[serde(default)]
    pub latest_step_subtasks: usize,
    #[serde(default)]
    pub subtask_outputs: Vec<Option<BlobPath>>,
    #[serde(default)]
    pub subtasks_definitions: Vec<SubtaskDefinition>,
    /// Seconds spent executing steps, summed over all steps
    #[serde(default)]
    pub duration: f64,

    pub created: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub completed: Option<DateTime<Utc>>,
}

/// Id of the `subtask_id`-th child of `parent_id`.
pub fn child_id(parent_id: &str, subtask_id: usize) -> String {
    format!("{}_{}", parent_id, subtask_id)
}

impl TaskInfo {
    /// Create the top-level node of a new job.
    ///
    /// # Postconditions
    /// - `total_progress == remaining_progress == 1.0`
    /// - `state == Ready`, `step == 0`
    #[allow(clippy::too_many_arguments)]
    pub fn new_job(
        job_id: &str,
        task_type: &str,
        user: &str,
        profile: &str,
        requirements: Requirements,
        subtype: String,
        storage: BlobPath,
        state_path: BlobPath,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: job_id.to_string(),
            version: 0,
            job_id: job_id.to_string(),
            parent_id: None,
            subtask_id: None,
            task_type: task_type.to_string(),
            subtype,
            user: user.to_string(),
            profile: profile.to_string(),
            requirements,
            state: TaskState::Ready,
            step: 0,
            error_count: 0,
            error: None,
            worker_id: None,
            total_progress: 1.0,
            remaining_progress: 1.0,
            prev_progress: 0.0,
            cur_progress: 0.0,
            progress_children: 0.0,
            storage,
            state_path,
            output_path: None,
            subtasks_pending: 0,
            latest_step_subtasks: 0,
            subtask_outputs: Vec::new(),
            subtasks_definitions: Vec::new(),
            duration: 0.0,
            created: now,
            last_update: now,
            completed: None,
        }
    }

    /// Create the node for `def`, a child of `parent` weighted `weight`.
    pub fn new_child(parent: &TaskInfo, def: &SubtaskDefinition, weight: f64, profile: &str) -> Self {
        let id = child_id(&parent.id, def.id);
        let mut child = Self::new_job(
            &parent.job_id,
            &def.task_type,
            &parent.user,
            profile,
            def.requirements,
            def.subtype.clone(),
            parent.storage.append(&format!("{}", def.id)),
            def.state_path.clone(),
        );
        child.id = id;
        child.parent_id = Some(parent.id.clone());
        child.subtask_id = Some(def.id);
        child.total_progress = weight;
        child.remaining_progress = weight;
        child
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Progress this node has accounted for so far.
    pub fn progress(&self) -> f64 {
        self.prev_progress + self.cur_progress
    }

    /// Project this node into the input of its next attempt.
    pub fn to_attempt(&self) -> TaskAttempt {
        TaskAttempt {
            task_id: self.id.clone(),
            state_counter: self.step,
            attempt_number: self.error_count,
            user: self.user.clone(),
            working_path: self.storage.clone(),
            task_type: self.task_type.clone(),
            state_path: self.state_path.clone(),
            subtask_outputs: self.subtask_outputs.clone(),
        }
    }

    /// Whether a result for step `state_counter` may still be applied.
    ///
    /// Anything else is stale and must be dropped without touching the node.
    pub fn accepts(&self, state_counter: u64) -> bool {
        self.state == TaskState::Running && self.step == state_counter
    }

    /// Definitions of the children created by the latest step.
    pub fn latest_subtasks(&self) -> &[SubtaskDefinition] {
        let start = self
            .subtasks_definitions
            .len()
            .saturating_sub(self.latest_step_subtasks);
        &self.subtasks_definitions[start..]
    }

    /// Weight each child of the latest step receives.
    pub fn child_weight(&self) -> f64 {
        let count = self.latest_subtasks().len();
        if count == 0 {
            0.0
        } else {
            self.progress_children / count as f64
        }
    }

    fn touch(&mut self) {
        self.last_update = Utc::now();
    }

    /// Mark the node as claimed by `worker_id`.
    pub fn claim(&mut self, worker_id: &str) {
        self.state = TaskState::Running;
        self.worker_id = Some(worker_id.to_string());
        self.touch();
    }

    /// Raise the current step's contribution from a heartbeat.
    ///
    /// Returns `true` if `cur_progress` changed. Progress never regresses.
    pub fn raise_progress(&mut self, cur_part: f64, progress: f64) -> bool {
        let reported = self.remaining_progress * cur_part * progress;
        if reported > self.cur_progress {
            self.cur_progress = reported;
            self.touch();
            true
        } else {
            false
        }
    }

    /// Apply an `error` result.
    ///
    /// A fatal-invariant error exhausts the node at once when
    /// `fail_fast_invariant` is set.
    pub fn apply_error(
        &mut self,
        result: &TaskAttemptResult,
        max_errors: u32,
        fail_fast_invariant: bool,
    ) -> ErrorDisposition {
        self.error_count += 1;
        self.error = result.error.clone();
        self.worker_id = None;
        self.touch();

        let fatal = fail_fast_invariant && result.error_kind == Some(ErrorKind::FatalInvariant);
        if fatal || self.error_count > max_errors {
            self.state = TaskState::Cancelled;
            ErrorDisposition::Exhausted
        } else {
            self.state = TaskState::Ready;
            ErrorDisposition::Retry
        }
    }

    /// Apply a `done` result.
    ///
    /// # Postcondition
    /// `cur_progress == remaining_progress`, whatever the step reported.
    pub fn apply_done(&mut self, result: &TaskAttemptResult, output_path: Option<BlobPath>) {
        self.duration += result.duration;
        self.cur_progress = self.remaining_progress;
        if let Some(path) = &result.state_path {
            self.state_path = path.clone();
        }
        self.output_path = output_path;
        self.state = TaskState::Done;
        self.worker_id = None;
        self.error = None;
        self.touch();
        self.completed = Some(self.last_update);
    }

    /// Apply a `new` result: the step finished and the task goes on.
    pub fn apply_new(&mut self, result: &TaskAttemptResult) {
        let produced = result.subtasks.len();

        self.duration += result.duration;
        self.cur_progress = self.remaining_progress * result.cur_part;
        self.progress_children = if produced > 0 {
            (self.remaining_progress * (1.0 - result.cur_part - result.future_part)).max(0.0)
        } else {
            0.0
        };
        self.prev_progress += self.cur_progress;
        self.cur_progress = 0.0;
        self.remaining_progress *= result.future_part;

        self.subtasks_definitions
            .extend(result.subtasks.iter().cloned());
        self.error_count = 0;
        self.error = None;
        self.step += 1;
        if let Some(path) = &result.state_path {
            self.state_path = path.clone();
        }
        self.subtasks_pending = produced;
        self.latest_step_subtasks = produced;
        self.subtask_outputs
            .extend(std::iter::repeat(None).take(produced));
        self.worker_id = None;
        self.state = if produced > 0 {
            TaskState::AddingChildren
        } else {
            TaskState::Ready
        };
        self.touch();
    }

    /// Apply `result` according to its outcome.
    ///
    /// Returns the error disposition for `error` results.
    pub fn apply(
        &mut self,
        result: &TaskAttemptResult,
        output_path: Option<BlobPath>,
        max_errors: u32,
        fail_fast_invariant: bool,
    ) -> Option<ErrorDisposition> {
        match result.result {
            AttemptOutcome::Error => Some(self.apply_error(result, max_errors, fail_fast_invariant)),
            AttemptOutcome::Done => {
                self.apply_done(result, output_path);
                None
            }
            AttemptOutcome::New => {
                self.apply_new(result);
                None
            }
        }
    }

    /// Record a finished child's output.
    ///
    /// Returns `false` if the output was already recorded (or the id is
    /// unknown), in which case nothing changed.
    pub fn record_child_output(&mut self, subtask_id: usize, output_path: BlobPath) -> bool {
        let Some(slot) = self.subtask_outputs.get_mut(subtask_id) else {
            return false;
        };
        if slot.is_some() {
            return false;
        }
        *slot = Some(output_path);
        self.subtasks_pending = self.subtasks_pending.saturating_sub(1);
        if self.subtasks_pending == 0 && self.state == TaskState::Pending {
            self.state = TaskState::Ready;
        }
        self.touch();
        true
    }
}
