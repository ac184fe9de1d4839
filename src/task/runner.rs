//! Single-attempt execution.
//!
//! A [`TaskRunner`] takes one [`TaskAttempt`], instantiates the task by type,
//! loads its state, runs one step and fills in a [`TaskAttemptResult`]. No
//! failure escapes: invariant violations, task errors and even panics all
//! become an `error` result so the worker can retry the attempt.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use super::attempt::{AttemptOutcome, SubtaskDefinition, TaskAttempt, TaskAttemptResult};
use super::error::AttemptError;
use super::heartbeat::ProgressSink;
use super::registry::TaskRegistry;
use super::task::{Task, TaskContext};
use crate::blob::{BlobPath, BlobStore};

/// Tolerance for `cur_part + future_part <= 1` under floating point.
const SPLIT_EPSILON: f64 = 1e-9;

/// Executes exactly one attempt.
pub struct TaskRunner {
    registry: Arc<TaskRegistry>,
    blobs: Arc<dyn BlobStore>,
    attempt: TaskAttempt,
    sink: Option<Box<dyn ProgressSink>>,
    superseded: bool,
}

impl TaskRunner {
    pub fn new(registry: Arc<TaskRegistry>, blobs: Arc<dyn BlobStore>, attempt: TaskAttempt) -> Self {
        Self {
            registry,
            blobs,
            attempt,
            sink: None,
            superseded: false,
        }
    }

    /// Push progress reports to `sink` while the step runs.
    pub fn with_progress_sink(mut self, sink: Box<dyn ProgressSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn attempt(&self) -> &TaskAttempt {
        &self.attempt
    }

    /// Whether the coordinator told us during the run that the attempt is
    /// no longer current.
    pub fn superseded(&self) -> bool {
        self.superseded
    }

    /// Run the attempt and populate `result`.
    pub async fn run(&mut self, result: &mut TaskAttemptResult) {
        *result = TaskAttemptResult::for_attempt(&self.attempt);
        let started = Instant::now();

        // Covers state loading and dumping as well as the task body.
        let outcome = match AssertUnwindSafe(self.execute(result)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Err(AttemptError::Panicked(panic_message(panic))),
        };
        result.duration = started.elapsed().as_secs_f64();

        match outcome {
            Ok(()) => tracing::debug!(
                "Attempt {}@{} finished: {}",
                self.attempt.task_id,
                self.attempt.state_counter,
                result.result
            ),
            Err(err) => {
                if matches!(err, AttemptError::Superseded) {
                    self.superseded = true;
                }
                let message = format!(
                    "{} (task type {}, state {})",
                    err, self.attempt.task_type, self.attempt.state_path
                );
                tracing::warn!(
                    "Attempt {}@{} failed: {}",
                    self.attempt.task_id,
                    self.attempt.state_counter,
                    message
                );
                result.fail(message, err.kind());
            }
        }
    }

    async fn execute(&mut self, result: &mut TaskAttemptResult) -> Result<(), AttemptError> {
        let mut task = self
            .registry
            .create_task(&self.attempt.task_type)
            .ok_or_else(|| AttemptError::UnknownTaskType(self.attempt.task_type.clone()))?;
        let state = self.blobs.get(&self.attempt.state_path).await?;
        task.load_state(&state)?;

        let mut ctx = AttemptContext {
            attempt: &self.attempt,
            result,
            blobs: self.blobs.as_ref(),
            sink: self.sink.as_deref_mut(),
            progress: 0.0,
            superseded: false,
        };
        let body = task.run(&mut ctx).await;
        let superseded = ctx.superseded;
        drop(ctx);

        // Nothing of a superseded step is kept, even if the body swallowed
        // the error.
        if superseded {
            return Err(AttemptError::Superseded);
        }
        body.map_err(AttemptError::from_task_error)?;

        if result.output.is_some() && !result.subtasks.is_empty() {
            return Err(AttemptError::OutputWithSubtasks {
                count: result.subtasks.len(),
            });
        }

        let new_state = task.dump_state()?;
        let state_path = self
            .attempt
            .working_path
            .unique(&format!("state-{}", self.attempt.state_counter + 1));
        self.blobs.put(&state_path, new_state).await?;
        result.state_path = Some(state_path);
        Ok(())
    }
}

pub(crate) fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// The runner's side of [`TaskContext`] for one attempt.
struct AttemptContext<'a> {
    attempt: &'a TaskAttempt,
    result: &'a mut TaskAttemptResult,
    blobs: &'a dyn BlobStore,
    sink: Option<&'a mut (dyn ProgressSink + 'static)>,
    /// Last reported progress of this step
    progress: f64,
    superseded: bool,
}

impl AttemptContext<'_> {
    fn next_subtask_id(&self) -> usize {
        self.attempt.subtask_outputs.len() + self.result.subtasks.len()
    }

    fn subtask_state_path(&self, id: usize) -> BlobPath {
        self.attempt
            .working_path
            .unique(&format!("subtask-{}", id))
    }
}

#[async_trait]
impl TaskContext for AttemptContext<'_> {
    fn attempt(&self) -> &TaskAttempt {
        self.attempt
    }

    async fn add_subtask(
        &mut self,
        task_type: &str,
        task: Box<dyn Task>,
    ) -> Result<usize, AttemptError> {
        if self.superseded {
            return Err(AttemptError::Superseded);
        }
        let id = self.next_subtask_id();
        let state = task.dump_state()?;
        let state_path = self.subtask_state_path(id);
        self.blobs.put(&state_path, state).await?;

        self.result.subtasks.push(SubtaskDefinition {
            id,
            task_type: task_type.to_string(),
            state_path,
            requirements: task.requirements(),
            subtype: task.subtype(),
        });
        Ok(id)
    }

    async fn get_output_string(&self, id: usize) -> Result<String, AttemptError> {
        let path = self
            .attempt
            .subtask_outputs
            .get(id)
            .and_then(|slot| slot.as_ref())
            .ok_or(AttemptError::MissingSubtaskOutput(id))?;
        Ok(self.blobs.get_string(path).await?)
    }

    fn set_output_string(&mut self, output: String) {
        self.result.result = AttemptOutcome::Done;
        self.result.output = Some(output);
    }

    async fn update_progress(&mut self, progress: f64) -> Result<bool, AttemptError> {
        if self.superseded {
            return Err(AttemptError::Superseded);
        }
        if !(0.0..=1.0).contains(&progress) || progress < self.progress {
            return Err(AttemptError::InvalidProgress {
                value: progress,
                last: self.progress,
            });
        }
        self.progress = progress;

        let Some(sink) = self.sink.as_deref_mut() else {
            return Ok(true);
        };
        if !sink.report(self.result, progress).await? {
            self.superseded = true;
            return Err(AttemptError::Superseded);
        }
        Ok(true)
    }

    fn split_progress(&mut self, cur_part: f64, future_part: f64) -> Result<(), AttemptError> {
        let invalid = |reason| AttemptError::InvalidSplit {
            cur_part,
            future_part,
            reason,
        };
        if !(cur_part >= 0.0 && future_part >= 0.0) {
            return Err(invalid("parts must be non-negative"));
        }
        if cur_part + future_part > 1.0 + SPLIT_EPSILON {
            return Err(invalid("parts add up to more than 1"));
        }
        if self.progress > 0.0 && cur_part < self.result.cur_part {
            return Err(invalid("cur_part cannot shrink after progress was reported"));
        }
        self.result.cur_part = cur_part;
        self.result.future_part = future_part;
        Ok(())
    }
}
