//! Attempt and result records exchanged between worker and runner.
//!
//! A [`TaskAttempt`] is projected from a `TaskInfo` snapshot when a worker
//! claims work, consumed once by a `TaskRunner`, and never mutated. The
//! runner answers with exactly one [`TaskAttemptResult`], which the worker
//! applies back to the store.

use serde::{Deserialize, Serialize};

use super::error::ErrorKind;
use super::task::Requirements;
use crate::blob::BlobPath;

/// Input to one execution of a task step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAttempt {
    pub task_id: String,
    /// Step number the coordinator believes is current
    pub state_counter: u64,
    pub attempt_number: u32,
    pub user: String,
    /// Where this attempt writes new state and subtask state
    pub working_path: BlobPath,
    #[serde(rename = "type")]
    pub task_type: String,
    pub state_path: BlobPath,
    /// Output paths of earlier children, indexed by subtask id.
    /// `None` while the child is still running.
    #[serde(default)]
    pub subtask_outputs: Vec<Option<BlobPath>>,
}

/// Description of one child task produced by a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskDefinition {
    pub id: usize,
    #[serde(rename = "type")]
    pub task_type: String,
    pub state_path: BlobPath,
    pub requirements: Requirements,
    #[serde(default)]
    pub subtype: String,
}

/// How a step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Error,
    /// Step finished; the task continues (possibly after its subtasks)
    New,
    Done,
}

impl std::fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptOutcome::Error => write!(f, "error"),
            AttemptOutcome::New => write!(f, "new"),
            AttemptOutcome::Done => write!(f, "done"),
        }
    }
}

/// Output of one attempt.
///
/// # Invariants
/// - `0 <= cur_part`, `0 <= future_part`, `cur_part + future_part <= 1`
/// - `output.is_some()` and `!subtasks.is_empty()` never hold together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAttemptResult {
    pub task_id: String,
    pub state_counter: u64,
    pub attempt_number: u32,
    pub result: AttemptOutcome,
    /// Share of the remaining budget consumed by this step
    pub cur_part: f64,
    /// Share of the remaining budget kept for later steps of this task
    pub future_part: f64,
    pub state_path: Option<BlobPath>,
    pub output: Option<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
    /// Wall-clock seconds spent in the step
    pub duration: f64,
    #[serde(default)]
    pub subtasks: Vec<SubtaskDefinition>,
}

impl TaskAttemptResult {
    /// Fresh result for `attempt`: `new`, consuming the whole remaining budget.
    pub fn for_attempt(attempt: &TaskAttempt) -> Self {
        Self {
            task_id: attempt.task_id.clone(),
            state_counter: attempt.state_counter,
            attempt_number: attempt.attempt_number,
            result: AttemptOutcome::New,
            cur_part: 1.0,
            future_part: 0.0,
            state_path: None,
            output: None,
            error: None,
            error_kind: None,
            duration: 0.0,
            subtasks: Vec::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.result == AttemptOutcome::Error
    }

    /// Record a failure, discarding anything the step produced.
    pub fn fail(&mut self, message: String, kind: ErrorKind) {
        self.result = AttemptOutcome::Error;
        self.error = Some(message);
        self.error_kind = Some(kind);
        self.output = None;
        self.state_path = None;
        self.subtasks.clear();
    }
}
