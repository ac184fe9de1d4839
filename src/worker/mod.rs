//! Worker-side orchestration.
//!
//! A [`TaskWorker`] claims ready nodes, relays heartbeat progress and applies
//! attempt results back to the store. Every mutation is a read, modify,
//! conditional-write cycle repeated until the write lands; nothing is locked
//! while a task body runs.
//!
//! - [`tree`]: job submission, child creation, parent wake-up, job-wide
//!   cancel / erase / resurrect
//! - [`run_loop`]: claim, run, apply, repeat

mod run_loop;
mod tree;

pub use run_loop::{run_attempt, run_loop, run_next, LoopExit, LoopOptions, StepReport};

use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::blob::{BlobError, BlobStore};
use crate::store::{StoreError, TaskDb};
use crate::task::{
    panic_message, AttemptOutcome, ErrorDisposition, ProgressRelay, Requirements, TaskAttempt,
    TaskAttemptResult, TaskInfo, TaskRegistry, TaskState, HIMEM_PROFILE,
};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("invalid initial state for {task_type}: {source}")]
    InvalidState {
        task_type: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("job {job_id} is {state}, expected {expected}")]
    InvalidJobState {
        job_id: String,
        state: TaskState,
        expected: TaskState,
    },
}

/// Scheduling knobs handed to a worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Default heartbeat cadence
    pub update_interval: Duration,
    /// Heartbeat backoff is capped at half of this
    pub task_timeout: Duration,
    pub max_errors: u32,
    /// Profiles that get no retries at all
    pub no_retry_profiles: Vec<String>,
    /// Tasks needing more memory than this go to the himem profile
    pub himem_threshold_mb: u64,
    /// Cancel on the first invariant violation instead of retrying it
    pub fail_fast_invariant: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_secs(10),
            task_timeout: Duration::from_secs(3600),
            max_errors: 5,
            no_retry_profiles: vec![HIMEM_PROFILE.to_string()],
            himem_threshold_mb: 16_384,
            fail_fast_invariant: false,
        }
    }
}

impl WorkerConfig {
    /// Retry budget for nodes of `profile`.
    pub fn max_errors_for(&self, profile: &str) -> u32 {
        if self.no_retry_profiles.iter().any(|p| p == profile) {
            0
        } else {
            self.max_errors
        }
    }

    pub fn profile_for(&self, requirements: &Requirements) -> &'static str {
        requirements.profile(self.himem_threshold_mb)
    }
}

/// What `apply_results` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The node had moved on; nothing was written
    Stale,
    /// The result was written and left the node in this state
    Applied(TaskState),
}

pub struct TaskWorker {
    db: Arc<dyn TaskDb>,
    blobs: Arc<dyn BlobStore>,
    registry: Arc<TaskRegistry>,
    config: WorkerConfig,
    worker_id: String,
}

impl TaskWorker {
    pub fn new(
        db: Arc<dyn TaskDb>,
        blobs: Arc<dyn BlobStore>,
        registry: Arc<TaskRegistry>,
        config: WorkerConfig,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            db,
            blobs,
            registry,
            config,
            worker_id: worker_id.into(),
        }
    }

    pub fn db(&self) -> &Arc<dyn TaskDb> {
        &self.db
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claim the oldest `ready` (or `queued`) node of `profile`.
    ///
    /// Parents left in `adding_children` by a crashed worker are completed
    /// first. When the queue looks empty, parents whose finished children
    /// were never recorded are woken and the claim is tried once more.
    /// Returns `None` when nothing is claimable.
    pub async fn claim(
        &self,
        profile: &str,
        queued: bool,
    ) -> Result<Option<TaskAttempt>, WorkerError> {
        self.recover_adding_children().await?;

        if let Some(attempt) = self.claim_next(profile, queued).await? {
            return Ok(Some(attempt));
        }
        if self.recover_pending_parents().await? == 0 {
            return Ok(None);
        }
        self.claim_next(profile, queued).await
    }

    async fn claim_next(
        &self,
        profile: &str,
        queued: bool,
    ) -> Result<Option<TaskAttempt>, WorkerError> {
        loop {
            let Some(mut info) = self.db.get_for_profile(profile, queued).await? else {
                return Ok(None);
            };
            info.claim(&self.worker_id);
            if self.db.put(&mut info).await? {
                tracing::info!(
                    "Worker {} claimed {} (type {}, step {}, attempt {})",
                    self.worker_id,
                    info.id,
                    info.task_type,
                    info.step,
                    info.error_count
                );
                return Ok(Some(info.to_attempt()));
            }
            tracing::debug!("Lost claim race for {}; trying next candidate", info.id);
        }
    }

    /// Claim from the `ready` queue of `profile`.
    pub async fn get_attempt_for_profile(
        &self,
        profile: &str,
    ) -> Result<Option<TaskAttempt>, WorkerError> {
        self.claim(profile, false).await
    }

    /// Attempt for an explicit node, for ad-hoc re-execution.
    ///
    /// A claimable node is marked `running` under this worker first; a node
    /// that is already running is projected as is. Anything else has no
    /// runnable step and yields `None`.
    pub async fn get_attempt_for_id(&self, id: &str) -> Result<Option<TaskAttempt>, WorkerError> {
        loop {
            let Some(mut info) = self.db.get(id).await? else {
                return Err(WorkerError::NotFound(id.to_string()));
            };
            if info.state == TaskState::Running {
                return Ok(Some(info.to_attempt()));
            }
            if !info.state.is_claimable() {
                tracing::warn!("Task {} is {}; nothing to run", id, info.state);
                return Ok(None);
            }
            info.claim(&self.worker_id);
            if self.db.put(&mut info).await? {
                tracing::info!("Worker {} claimed {} by id", self.worker_id, id);
                return Ok(Some(info.to_attempt()));
            }
            tracing::debug!("Conflict claiming {}; retrying", id);
        }
    }

    /// Attempt this worker held before a restart, if any.
    pub async fn resume(&self) -> Result<Option<TaskAttempt>, WorkerError> {
        let info = self.db.get_for_worker(&self.worker_id).await?;
        if let Some(info) = &info {
            tracing::info!(
                "Worker {} resuming {} at step {}",
                self.worker_id,
                info.id,
                info.step
            );
        }
        Ok(info.map(|info| info.to_attempt()))
    }

    /// Apply a heartbeat.
    ///
    /// Returns `false` once the node no longer matches the attempt behind
    /// `result`: missing, at another step, or not running.
    pub async fn update_progress(
        &self,
        result: &TaskAttemptResult,
        progress: f64,
    ) -> Result<bool, WorkerError> {
        loop {
            let Some(mut info) = self.db.get(&result.task_id).await? else {
                return Ok(false);
            };
            if !info.accepts(result.state_counter) {
                return Ok(false);
            }
            if !info.raise_progress(result.cur_part, progress) {
                return Ok(true);
            }
            if self.db.put(&mut info).await? {
                tracing::debug!(
                    "Progress of {} step {} now {:.4}",
                    info.id,
                    info.step,
                    info.cur_progress
                );
                return Ok(true);
            }
            tracing::debug!("Conflict updating progress of {}; retrying", info.id);
        }
    }

    /// Apply one attempt result to its node.
    ///
    /// Stale results are dropped without touching the store. After the
    /// write lands, the follow-up work the new state calls for runs here:
    /// the completion hook and parent wake-up on `done`, child creation on
    /// `adding_children`, job cancellation when retries are exhausted.
    pub async fn apply_results(
        &self,
        result: &TaskAttemptResult,
    ) -> Result<ApplyOutcome, WorkerError> {
        let mut output_path = None;

        let (info, disposition) = loop {
            let Some(mut info) = self.db.get(&result.task_id).await? else {
                tracing::warn!("Dropping result for missing task {}", result.task_id);
                return Ok(ApplyOutcome::Stale);
            };
            if !info.accepts(result.state_counter) {
                tracing::warn!(
                    "Dropping stale result for {}: step {} state {}, result for step {}",
                    info.id,
                    info.step,
                    info.state,
                    result.state_counter
                );
                return Ok(ApplyOutcome::Stale);
            }

            if output_path.is_none() {
                if let Some(output) = result.output.as_deref() {
                    let path = info.storage.unique("output");
                    self.blobs.put_string(&path, output).await?;
                    output_path = Some(path);
                }
            }

            let max_errors = self.config.max_errors_for(&info.profile);
            let disposition = info.apply(
                result,
                output_path.clone(),
                max_errors,
                self.config.fail_fast_invariant,
            );
            if self.db.put(&mut info).await? {
                break (info, disposition);
            }
            tracing::debug!("Conflict applying result to {}; retrying", info.id);
        };

        tracing::info!(
            "Applied {} result to {}: now {} (step {})",
            result.result,
            info.id,
            info.state,
            info.step
        );

        match (result.result, disposition) {
            (AttemptOutcome::Done, _) => {
                if info.is_root() {
                    self.run_completion_hook(&info, result.output.as_deref())
                        .await;
                } else {
                    self.notify_parent(&info).await?;
                }
            }
            (AttemptOutcome::New, _) if info.state == TaskState::AddingChildren => {
                self.add_children(&info).await?;
            }
            (AttemptOutcome::Error, Some(ErrorDisposition::Exhausted)) => {
                let reason = format!(
                    "task {} failed {} times: {}",
                    info.id,
                    info.error_count,
                    info.error.as_deref().unwrap_or("unknown error")
                );
                tracing::warn!("Retries exhausted, cancelling job {}: {}", info.job_id, reason);
                self.cancel_job(&info.job_id, &reason).await?;
            }
            _ => {}
        }

        Ok(ApplyOutcome::Applied(info.state))
    }

    /// Run the top-level task's completion hook. Failures are logged only;
    /// the job is already done.
    async fn run_completion_hook(&self, info: &TaskInfo, output: Option<&str>) {
        let Some(mut task) = self.registry.create_task(&info.task_type) else {
            tracing::warn!(
                "No completion hook for {}: unknown task type {}",
                info.id,
                info.task_type
            );
            return;
        };
        let hook = async {
            let state = self.blobs.get(&info.state_path).await?;
            task.load_state(&state)?;
            task.on_job_complete(output).await
        };
        let outcome: Result<anyhow::Result<()>, _> = AssertUnwindSafe(hook).catch_unwind().await;
        match outcome {
            Ok(Ok(())) => tracing::info!("Job {} complete", info.job_id),
            Ok(Err(e)) => tracing::warn!("Completion hook of job {} failed: {}", info.job_id, e),
            Err(panic) => tracing::warn!(
                "Completion hook of job {} panicked: {}",
                info.job_id,
                panic_message(panic)
            ),
        }
    }
}

#[async_trait]
impl ProgressRelay for TaskWorker {
    async fn relay_progress(
        &self,
        result: &TaskAttemptResult,
        progress: f64,
    ) -> anyhow::Result<bool> {
        Ok(self.update_progress(result, progress).await?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::blob::{BlobPath, InMemoryBlobStore};
    use crate::builtin::{self, EchoTask, FanOutTask};
    use crate::store::InMemoryTaskDb;
    use crate::task::{encode_state, ErrorKind, SubtaskDefinition, Task, TaskContext};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const EPS: f64 = 1e-9;

    pub(crate) struct Fixture {
        pub worker: Arc<TaskWorker>,
        pub db: Arc<InMemoryTaskDb>,
        pub blobs: Arc<InMemoryBlobStore>,
    }

    pub(crate) fn fixture_with(config: WorkerConfig) -> Fixture {
        fixture_with_registry(config, builtin::registry())
    }

    fn fixture_with_registry(config: WorkerConfig, registry: TaskRegistry) -> Fixture {
        let db = Arc::new(InMemoryTaskDb::new());
        let blobs = Arc::new(InMemoryBlobStore::new());
        let worker = Arc::new(TaskWorker::new(
            db.clone(),
            blobs.clone(),
            Arc::new(registry),
            config,
            "w1",
        ));
        Fixture { worker, db, blobs }
    }

    pub(crate) fn fixture() -> Fixture {
        fixture_with(WorkerConfig::default())
    }

    pub(crate) async fn submit_echo(worker: &TaskWorker, message: &str) -> String {
        let state = encode_state(&EchoTask::new(message)).unwrap();
        worker.submit_job("echo", "alice", state).await.unwrap()
    }

    pub(crate) async fn submit_fan_out(worker: &TaskWorker, items: &[&str]) -> String {
        let task = FanOutTask::new(items.iter().map(|s| s.to_string()).collect());
        let state = encode_state(&task).unwrap();
        worker.submit_job("fan_out", "alice", state).await.unwrap()
    }

    fn new_result(attempt: &TaskAttempt, cur_part: f64, future_part: f64) -> TaskAttemptResult {
        let mut result = TaskAttemptResult::for_attempt(attempt);
        result.cur_part = cur_part;
        result.future_part = future_part;
        result.state_path = Some(attempt.working_path.unique("state"));
        result
    }

    fn subtask(id: usize) -> SubtaskDefinition {
        SubtaskDefinition {
            id,
            task_type: "echo".into(),
            state_path: BlobPath::new(format!("defs/{}", id)),
            requirements: Requirements::default(),
            subtype: String::new(),
        }
    }

    fn error_result(attempt: &TaskAttempt, kind: ErrorKind) -> TaskAttemptResult {
        let mut result = TaskAttemptResult::for_attempt(attempt);
        result.fail("boom".into(), kind);
        result
    }

    #[tokio::test]
    async fn test_claim_marks_running_and_empty_queue_is_none() {
        let f = fixture();
        let job = submit_echo(&f.worker, "hi").await;

        let attempt = f.worker.get_attempt_for_profile("normal").await.unwrap().unwrap();
        assert_eq!(attempt.task_id, job);
        assert_eq!(attempt.state_counter, 0);
        assert_eq!(attempt.attempt_number, 0);

        let info = f.db.get(&job).await.unwrap().unwrap();
        assert_eq!(info.state, TaskState::Running);
        assert_eq!(info.worker_id.as_deref(), Some("w1"));

        assert!(f.worker.get_attempt_for_profile("normal").await.unwrap().is_none());
        assert!(f.worker.get_attempt_for_profile("himem").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resume_finds_held_attempt() {
        let f = fixture();
        let job = submit_echo(&f.worker, "hi").await;
        assert!(f.worker.resume().await.unwrap().is_none());
        f.worker.claim("normal", false).await.unwrap().unwrap();

        let resumed = f.worker.resume().await.unwrap().unwrap();
        assert_eq!(resumed.task_id, job);
    }

    #[tokio::test]
    async fn test_get_attempt_for_id() {
        let f = fixture();
        let job = submit_echo(&f.worker, "hi").await;

        let attempt = f.worker.get_attempt_for_id(&job).await.unwrap().unwrap();
        assert_eq!(attempt.task_id, job);
        assert_eq!(
            f.db.get(&job).await.unwrap().unwrap().state,
            TaskState::Running
        );
        // Running nodes are projected as they are
        assert!(f.worker.get_attempt_for_id(&job).await.unwrap().is_some());
        assert!(matches!(
            f.worker.get_attempt_for_id("nope").await,
            Err(WorkerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_update_progress_raises_and_never_regresses() {
        let f = fixture();
        let job = submit_echo(&f.worker, "hi").await;
        let attempt = f.worker.claim("normal", false).await.unwrap().unwrap();
        let mut result = TaskAttemptResult::for_attempt(&attempt);
        result.cur_part = 0.5;

        assert!(f.worker.update_progress(&result, 0.4).await.unwrap());
        let info = f.db.get(&job).await.unwrap().unwrap();
        assert!((info.cur_progress - 0.2).abs() < EPS);

        assert!(f.worker.update_progress(&result, 0.2).await.unwrap());
        let info = f.db.get(&job).await.unwrap().unwrap();
        assert!((info.cur_progress - 0.2).abs() < EPS);
    }

    #[tokio::test]
    async fn test_update_progress_reports_stale() {
        let f = fixture();
        let job = submit_echo(&f.worker, "hi").await;
        let attempt = f.worker.claim("normal", false).await.unwrap().unwrap();

        let mut old = TaskAttemptResult::for_attempt(&attempt);
        old.state_counter = 7;
        assert!(!f.worker.update_progress(&old, 0.5).await.unwrap());

        let mut missing = TaskAttemptResult::for_attempt(&attempt);
        missing.task_id = "gone".into();
        assert!(!f.worker.update_progress(&missing, 0.5).await.unwrap());

        f.worker.cancel_job(&job, "operator").await.unwrap();
        let current = TaskAttemptResult::for_attempt(&attempt);
        assert!(!f.worker.update_progress(&current, 0.5).await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_result_leaves_node_unchanged() {
        let f = fixture();
        let job = submit_echo(&f.worker, "hi").await;
        let mut attempt = f.worker.claim("normal", false).await.unwrap().unwrap();

        let mut info = f.db.get(&job).await.unwrap().unwrap();
        info.step = 5;
        assert!(f.db.put(&mut info).await.unwrap());
        let before = f.db.get(&job).await.unwrap().unwrap();

        attempt.state_counter = 4;
        let result = new_result(&attempt, 1.0, 0.0);
        assert_eq!(
            f.worker.apply_results(&result).await.unwrap(),
            ApplyOutcome::Stale
        );
        assert_eq!(f.db.get(&job).await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn test_duplicate_result_applied_once() {
        let f = fixture();
        let job = submit_echo(&f.worker, "hi").await;
        let attempt = f.worker.claim("normal", false).await.unwrap().unwrap();
        let result = new_result(&attempt, 0.5, 0.5);

        assert_eq!(
            f.worker.apply_results(&result).await.unwrap(),
            ApplyOutcome::Applied(TaskState::Ready)
        );
        assert_eq!(
            f.worker.apply_results(&result).await.unwrap(),
            ApplyOutcome::Stale
        );
        let info = f.db.get(&job).await.unwrap().unwrap();
        assert_eq!(info.step, 1);
        assert!((info.prev_progress - 0.5).abs() < EPS);
    }

    #[tokio::test]
    async fn test_new_result_arithmetic_and_children() {
        let f = fixture();
        let job = submit_echo(&f.worker, "hi").await;
        let attempt = f.worker.claim("normal", false).await.unwrap().unwrap();
        let mut result = new_result(&attempt, 0.4, 0.5);
        result.subtasks = vec![subtask(0), subtask(1)];

        assert_eq!(
            f.worker.apply_results(&result).await.unwrap(),
            ApplyOutcome::Applied(TaskState::AddingChildren)
        );

        let root = f.db.get(&job).await.unwrap().unwrap();
        assert!((root.progress_children - 0.1).abs() < EPS);
        assert!((root.remaining_progress - 0.5).abs() < EPS);
        assert!((root.prev_progress - 0.4).abs() < EPS);
        assert_eq!(root.cur_progress, 0.0);
        assert_eq!(root.error_count, 0);
        assert_eq!(root.step, 1);
        assert_eq!(root.subtask_outputs, vec![None, None]);
        assert_eq!(root.subtasks_pending, 2);
        // Children were materialised right after the write
        assert_eq!(root.state, TaskState::Pending);

        for i in 0..2 {
            let child = f.db.get(&format!("{}_{}", job, i)).await.unwrap().unwrap();
            assert_eq!(child.state, TaskState::Ready);
            assert_eq!(child.parent_id.as_deref(), Some(job.as_str()));
            assert_eq!(child.subtask_id, Some(i));
            assert!((child.total_progress - 0.05).abs() < EPS);
            assert!((child.remaining_progress - 0.05).abs() < EPS);
        }
    }

    #[tokio::test]
    async fn test_done_forces_remaining_progress() {
        let f = fixture();
        let job = submit_echo(&f.worker, "hi").await;
        let attempt = f.worker.claim("normal", false).await.unwrap().unwrap();
        let mut result = new_result(&attempt, 0.1, 0.0);
        result.result = AttemptOutcome::Done;
        result.output = Some("out".into());

        assert_eq!(
            f.worker.apply_results(&result).await.unwrap(),
            ApplyOutcome::Applied(TaskState::Done)
        );
        let info = f.db.get(&job).await.unwrap().unwrap();
        assert_eq!(info.cur_progress, info.remaining_progress);
        assert!((info.progress() - 1.0).abs() < EPS);
        assert!(info.completed.is_some());
        let output = info.output_path.unwrap();
        assert_eq!(f.blobs.get_string(&output).await.unwrap(), "out");
    }

    #[tokio::test]
    async fn test_retry_then_cancel_whole_job() {
        let f = fixture_with(WorkerConfig {
            max_errors: 2,
            ..WorkerConfig::default()
        });
        let job = submit_fan_out(&f.worker, &["a", "b"]).await;
        let report = run_next(&f.worker, &LoopOptions::default()).await.unwrap();
        assert!(report.is_some());
        let child = format!("{}_0", job);

        for expected in 1..=2 {
            let attempt = f.worker.get_attempt_for_id(&child).await.unwrap().unwrap();
            let outcome = f
                .worker
                .apply_results(&error_result(&attempt, ErrorKind::Retryable))
                .await
                .unwrap();
            assert_eq!(outcome, ApplyOutcome::Applied(TaskState::Ready));
            let info = f.db.get(&child).await.unwrap().unwrap();
            assert_eq!(info.error_count, expected);
            assert_eq!(info.error.as_deref(), Some("boom"));
        }

        let attempt = f.worker.get_attempt_for_id(&child).await.unwrap().unwrap();
        let outcome = f
            .worker
            .apply_results(&error_result(&attempt, ErrorKind::Retryable))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied(TaskState::Cancelled));

        for node in f.db.list_job(&job).await.unwrap() {
            assert_eq!(node.state, TaskState::Cancelled, "{}", node.id);
        }
        let root = f.db.get(&job).await.unwrap().unwrap();
        assert!(root.error.unwrap().contains("failed 3 times"));
    }

    #[tokio::test]
    async fn test_no_retry_profile() {
        let f = fixture();
        let state = encode_state(&EchoTask::new("big").with_memory_mb(64_000)).unwrap();
        let job = f.worker.submit_job("echo", "alice", state).await.unwrap();
        assert_eq!(f.db.get(&job).await.unwrap().unwrap().profile, "himem");

        let attempt = f.worker.claim("himem", false).await.unwrap().unwrap();
        let outcome = f
            .worker
            .apply_results(&error_result(&attempt, ErrorKind::Retryable))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied(TaskState::Cancelled));
    }

    #[tokio::test]
    async fn test_fail_fast_invariant() {
        let lenient = fixture();
        let job = submit_echo(&lenient.worker, "x").await;
        let attempt = lenient.worker.claim("normal", false).await.unwrap().unwrap();
        let outcome = lenient
            .worker
            .apply_results(&error_result(&attempt, ErrorKind::FatalInvariant))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied(TaskState::Ready));
        assert_eq!(lenient.db.get(&job).await.unwrap().unwrap().error_count, 1);

        let strict = fixture_with(WorkerConfig {
            fail_fast_invariant: true,
            ..WorkerConfig::default()
        });
        submit_echo(&strict.worker, "x").await;
        let attempt = strict.worker.claim("normal", false).await.unwrap().unwrap();
        let outcome = strict
            .worker
            .apply_results(&error_result(&attempt, ErrorKind::FatalInvariant))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied(TaskState::Cancelled));
    }

    #[tokio::test]
    async fn test_single_step_end_to_end() {
        let f = fixture();
        let job = submit_echo(&f.worker, "x").await;

        // First step: new, whole budget, no children
        let attempt = f.worker.claim("normal", false).await.unwrap().unwrap();
        let result = new_result(&attempt, 1.0, 0.0);
        assert_eq!(
            f.worker.apply_results(&result).await.unwrap(),
            ApplyOutcome::Applied(TaskState::Ready)
        );
        let info = f.db.get(&job).await.unwrap().unwrap();
        assert_eq!(info.remaining_progress, 0.0);
        assert!((info.prev_progress - 1.0).abs() < EPS);

        // Second step finishes it
        let attempt = f.worker.claim("normal", false).await.unwrap().unwrap();
        assert_eq!(attempt.state_counter, 1);
        let mut result = new_result(&attempt, 1.0, 0.0);
        result.result = AttemptOutcome::Done;
        result.output = Some("x".into());
        f.worker.apply_results(&result).await.unwrap();

        let info = f.db.get(&job).await.unwrap().unwrap();
        assert_eq!(info.state, TaskState::Done);
        assert_eq!(info.cur_progress, info.remaining_progress);
        assert!((f.worker.job_progress(&job).await.unwrap() - 1.0).abs() < EPS);
    }

    /// Store that makes the first few conditional writes lose.
    struct ContendedDb {
        inner: InMemoryTaskDb,
        conflicts: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl TaskDb for ContendedDb {
        fn is_persistent(&self) -> bool {
            false
        }
        async fn get(&self, id: &str) -> Result<Option<TaskInfo>, StoreError> {
            self.inner.get(id).await
        }
        async fn put(&self, info: &mut TaskInfo) -> Result<bool, StoreError> {
            use std::sync::atomic::Ordering;
            if info.version > 0
                && self
                    .conflicts
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                // Someone else wrote in between
                let mut other = self.inner.get(&info.id).await?.unwrap_or_else(|| info.clone());
                other.last_update = chrono::Utc::now();
                self.inner.put(&mut other).await?;
                return Ok(false);
            }
            self.inner.put(info).await
        }
        async fn erase(&self, info: &TaskInfo) -> Result<bool, StoreError> {
            self.inner.erase(info).await
        }
        async fn get_for_profile(
            &self,
            profile: &str,
            queued: bool,
        ) -> Result<Option<TaskInfo>, StoreError> {
            self.inner.get_for_profile(profile, queued).await
        }
        async fn get_for_worker(&self, worker_id: &str) -> Result<Option<TaskInfo>, StoreError> {
            self.inner.get_for_worker(worker_id).await
        }
        async fn list_job(&self, job_id: &str) -> Result<Vec<TaskInfo>, StoreError> {
            self.inner.list_job(job_id).await
        }
        async fn list_in_state(
            &self,
            state: TaskState,
            limit: usize,
        ) -> Result<Vec<TaskInfo>, StoreError> {
            self.inner.list_in_state(state, limit).await
        }
        async fn find_range(
            &self,
            index: crate::store::SummaryIndex,
            start_key: &[String],
            end_key: &[String],
            limit: Option<usize>,
            group_level: usize,
        ) -> Result<Vec<crate::store::SummaryResult>, StoreError> {
            self.inner
                .find_range(index, start_key, end_key, limit, group_level)
                .await
        }
    }

    #[tokio::test]
    async fn test_conflicts_are_retried_transparently() {
        let db = Arc::new(ContendedDb {
            inner: InMemoryTaskDb::new(),
            conflicts: std::sync::atomic::AtomicUsize::new(0),
        });
        let worker = TaskWorker::new(
            db.clone(),
            Arc::new(InMemoryBlobStore::new()),
            Arc::new(builtin::registry()),
            WorkerConfig::default(),
            "w1",
        );
        let job = submit_echo(&worker, "x").await;
        let attempt = worker.claim("normal", false).await.unwrap().unwrap();

        db.conflicts.store(3, std::sync::atomic::Ordering::SeqCst);
        let mut result = TaskAttemptResult::for_attempt(&attempt);
        result.cur_part = 0.5;
        assert!(worker.update_progress(&result, 1.0).await.unwrap());

        db.conflicts.store(3, std::sync::atomic::Ordering::SeqCst);
        let result = new_result(&attempt, 0.5, 0.5);
        assert_eq!(
            worker.apply_results(&result).await.unwrap(),
            ApplyOutcome::Applied(TaskState::Ready)
        );
        let info = db.get(&job).await.unwrap().unwrap();
        assert_eq!(info.step, 1);
        assert!((info.prev_progress - 0.5).abs() < EPS);
        assert_eq!(db.conflicts.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    /// Finishes in one step and counts completion hook runs.
    struct Hooked {
        hook_runs: Arc<AtomicUsize>,
        panic_in_hook: bool,
    }

    #[async_trait]
    impl Task for Hooked {
        async fn run(&mut self, ctx: &mut dyn TaskContext) -> anyhow::Result<()> {
            ctx.set_output_string("hooked".into());
            Ok(())
        }

        fn load_state(&mut self, _state: &[u8]) -> anyhow::Result<()> {
            Ok(())
        }

        fn dump_state(&self) -> anyhow::Result<Vec<u8>> {
            Ok(b"{}".to_vec())
        }

        async fn on_job_complete(&mut self, _output: Option<&str>) -> anyhow::Result<()> {
            self.hook_runs.fetch_add(1, Ordering::SeqCst);
            if self.panic_in_hook {
                panic!("hook blew up");
            }
            Ok(())
        }
    }

    fn hooked_fixture(config: WorkerConfig, panic_in_hook: bool) -> (Fixture, Arc<AtomicUsize>) {
        let hook_runs = Arc::new(AtomicUsize::new(0));
        let mut registry = builtin::registry();
        let runs = hook_runs.clone();
        registry.register("hooked", move || {
            Box::new(Hooked {
                hook_runs: runs.clone(),
                panic_in_hook,
            }) as Box<dyn Task>
        });
        (fixture_with_registry(config, registry), hook_runs)
    }

    fn done_result(attempt: &TaskAttempt) -> TaskAttemptResult {
        let mut result = TaskAttemptResult::for_attempt(attempt);
        result.result = AttemptOutcome::Done;
        result.output = Some("late".into());
        result.state_path = Some(attempt.state_path.clone());
        result
    }

    fn snapshot(info: &TaskInfo) -> Vec<u8> {
        serde_json::to_vec(info).unwrap()
    }

    #[tokio::test]
    async fn test_stale_error_result_is_dropped() {
        let f = fixture_with(WorkerConfig {
            max_errors: 0,
            ..WorkerConfig::default()
        });
        let job = submit_echo(&f.worker, "hi").await;
        let attempt = f.worker.claim("normal", false).await.unwrap().unwrap();

        // Old step: would exhaust the node and cancel the job if applied
        let mut old = error_result(&attempt, ErrorKind::Retryable);
        old.state_counter = 3;
        let before = snapshot(&f.db.get(&job).await.unwrap().unwrap());
        assert_eq!(
            f.worker.apply_results(&old).await.unwrap(),
            ApplyOutcome::Stale
        );
        let after = f.db.get(&job).await.unwrap().unwrap();
        assert_eq!(snapshot(&after), before);
        assert_eq!(after.state, TaskState::Running);

        // Current step, but the node is no longer running
        let mut info = after;
        info.state = TaskState::Ready;
        info.worker_id = None;
        assert!(f.db.put(&mut info).await.unwrap());
        let before = snapshot(&f.db.get(&job).await.unwrap().unwrap());
        assert_eq!(
            f.worker
                .apply_results(&error_result(&attempt, ErrorKind::Retryable))
                .await
                .unwrap(),
            ApplyOutcome::Stale
        );
        let after = f.db.get(&job).await.unwrap().unwrap();
        assert_eq!(snapshot(&after), before);
        assert_eq!(after.error_count, 0);
    }

    #[tokio::test]
    async fn test_stale_done_result_is_dropped() {
        let (f, hook_runs) = hooked_fixture(WorkerConfig::default(), false);
        let job = f
            .worker
            .submit_job("hooked", "alice", b"{}".to_vec())
            .await
            .unwrap();
        let attempt = f.worker.claim("normal", false).await.unwrap().unwrap();

        let mut info = f.db.get(&job).await.unwrap().unwrap();
        info.step = 5;
        assert!(f.db.put(&mut info).await.unwrap());
        let before = snapshot(&f.db.get(&job).await.unwrap().unwrap());
        let blobs_before = f.blobs.len().await;

        assert_eq!(
            f.worker.apply_results(&done_result(&attempt)).await.unwrap(),
            ApplyOutcome::Stale
        );
        assert_eq!(snapshot(&f.db.get(&job).await.unwrap().unwrap()), before);
        assert_eq!(hook_runs.load(Ordering::SeqCst), 0);
        // No output blob either
        assert_eq!(f.blobs.len().await, blobs_before);

        // The current step still completes and runs the hook once
        let mut current = done_result(&attempt);
        current.state_counter = 5;
        assert_eq!(
            f.worker.apply_results(&current).await.unwrap(),
            ApplyOutcome::Applied(TaskState::Done)
        );
        assert_eq!(hook_runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_completion_hook_panic_is_contained() {
        let (f, hook_runs) = hooked_fixture(WorkerConfig::default(), true);
        let job = f
            .worker
            .submit_job("hooked", "alice", b"{}".to_vec())
            .await
            .unwrap();
        let attempt = f.worker.claim("normal", false).await.unwrap().unwrap();

        let report = run_attempt(&f.worker, attempt).await.unwrap();
        assert_eq!(report.applied, Some(ApplyOutcome::Applied(TaskState::Done)));
        assert_eq!(hook_runs.load(Ordering::SeqCst), 1);
        assert_eq!(
            f.db.get(&job).await.unwrap().unwrap().state,
            TaskState::Done
        );
    }

    #[tokio::test]
    async fn test_exhausted_root_records_cancel_reason() {
        let f = fixture_with(WorkerConfig {
            max_errors: 0,
            ..WorkerConfig::default()
        });
        let job = submit_echo(&f.worker, "x").await;
        let attempt = f.worker.claim("normal", false).await.unwrap().unwrap();

        let outcome = f
            .worker
            .apply_results(&error_result(&attempt, ErrorKind::Retryable))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied(TaskState::Cancelled));

        let root = f.db.get(&job).await.unwrap().unwrap();
        assert_eq!(root.state, TaskState::Cancelled);
        let error = root.error.unwrap();
        assert!(error.contains(&format!("task {} failed 1 times", job)), "{}", error);
        assert!(error.contains("boom"));
    }
}
