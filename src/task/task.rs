//! The task contract: what a unit of work exposes to the scheduler.
//!
//! # Design Notes
//! - The scheduler only ever sees a task through [`Task`]: a type name, a
//!   state blob in, a state blob out. It never depends on the payload.
//! - A step talks back to the runner through [`TaskContext`]; nothing else
//!   about the attempt is mutable from inside the task body.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::attempt::TaskAttempt;
use super::error::AttemptError;

/// Profile for tasks that fit an ordinary worker.
pub const NORMAL_PROFILE: &str = "normal";

/// Profile for memory-heavy tasks.
pub const HIMEM_PROFILE: &str = "himem";

/// Resources a task needs from the worker that runs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirements {
    pub cpus: u32,
    pub memory_mb: u64,
}

impl Default for Requirements {
    fn default() -> Self {
        Self {
            cpus: 1,
            memory_mb: 1024,
        }
    }
}

impl Requirements {
    /// Worker-pool class able to satisfy these requirements.
    pub fn profile(&self, himem_threshold_mb: u64) -> &'static str {
        if self.memory_mb > himem_threshold_mb {
            HIMEM_PROFILE
        } else {
            NORMAL_PROFILE
        }
    }
}

/// A polymorphic unit of work, invoked once per attempt.
#[async_trait]
pub trait Task: Send {
    /// Run one step. The step either finishes the task (via
    /// [`TaskContext::set_output_string`]), creates subtasks, or simply
    /// returns so the next step runs later.
    async fn run(&mut self, ctx: &mut dyn TaskContext) -> anyhow::Result<()>;

    fn load_state(&mut self, state: &[u8]) -> anyhow::Result<()>;

    fn dump_state(&self) -> anyhow::Result<Vec<u8>>;

    fn requirements(&self) -> Requirements {
        Requirements::default()
    }

    /// Free-form tag used to group tasks of one type on dashboards.
    fn subtype(&self) -> String {
        String::new()
    }

    /// Called once when the top-level task of a job finishes.
    async fn on_job_complete(&mut self, output: Option<&str>) -> anyhow::Result<()> {
        let _ = output;
        Ok(())
    }
}

/// What a running step can do to its attempt.
#[async_trait]
pub trait TaskContext: Send {
    fn attempt(&self) -> &TaskAttempt;

    /// Register a child task and return its subtask id.
    ///
    /// # Postcondition
    /// The child's initial state is stored under the attempt's working path.
    async fn add_subtask(
        &mut self,
        task_type: &str,
        task: Box<dyn Task>,
    ) -> Result<usize, AttemptError>;

    /// Output of a completed child.
    ///
    /// # Errors
    /// [`AttemptError::MissingSubtaskOutput`] if `id` is out of range or the
    /// child has not completed.
    async fn get_output_string(&self, id: usize) -> Result<String, AttemptError>;

    /// Finish the task with `output`.
    fn set_output_string(&mut self, output: String);

    /// Report progress of the current step, in `[0, 1]`.
    ///
    /// Returns `true` while the attempt is current.
    ///
    /// # Errors
    /// [`AttemptError::InvalidProgress`] if `progress` is outside `[0, 1]`
    /// or lower than the last reported value.
    /// [`AttemptError::Superseded`] once the coordinator no longer
    /// recognises this attempt; propagate it with `?` so the step stops.
    /// Every later call fails the same way and nothing of the step is kept.
    async fn update_progress(&mut self, progress: f64) -> Result<bool, AttemptError>;

    /// Divide the remaining budget between this step and later steps.
    ///
    /// # Errors
    /// [`AttemptError::InvalidSplit`] if `cur_part + future_part > 1`, or if
    /// `cur_part` shrinks after progress has been reported. The sum may
    /// exceed 1 by up to `1e-9` to absorb floating-point rounding.
    fn split_progress(&mut self, cur_part: f64, future_part: f64) -> Result<(), AttemptError>;
}

/// Decode a task's state struct from its blob.
pub fn decode_state<T: DeserializeOwned>(state: &[u8]) -> anyhow::Result<T> {
    Ok(serde_json::from_slice(state)?)
}

/// Encode a task's state struct into a blob.
pub fn encode_state<T: Serialize>(state: &T) -> anyhow::Result<Vec<u8>> {
    Ok(serde_json::to_vec(state)?)
}
