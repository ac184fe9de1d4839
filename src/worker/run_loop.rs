//! The worker loop: claim, run, apply, repeat.

use std::sync::Arc;
use std::time::Duration;

use super::{ApplyOutcome, TaskWorker, WorkerError};
use crate::task::{
    AttemptOutcome, Heartbeat, ProgressRelay, TaskAttempt, TaskAttemptResult, TaskRunner,
    NORMAL_PROFILE,
};

/// What to claim and what to do when there is nothing to claim.
#[derive(Debug, Clone)]
pub struct LoopOptions {
    pub profile: String,
    /// Claim from `queued` instead of `ready`
    pub queued: bool,
    /// Sleep between polls of an empty queue; `None` exits instead
    pub poll_interval: Option<Duration>,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            profile: NORMAL_PROFILE.to_string(),
            queued: false,
            poll_interval: None,
        }
    }
}

/// Why [`run_loop`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Queue empty and polling disabled
    Idle,
    /// A heartbeat found the running attempt no longer current
    Superseded,
}

/// Summary of one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub task_id: String,
    pub outcome: AttemptOutcome,
    /// `None` when the result was never applied
    pub applied: Option<ApplyOutcome>,
    pub superseded: bool,
    pub duration: f64,
}

/// Run `attempt` with heartbeats and apply its result.
///
/// A superseded attempt is not applied: the node has moved on and the
/// result would be dropped as stale anyway.
pub async fn run_attempt(
    worker: &Arc<TaskWorker>,
    attempt: TaskAttempt,
) -> Result<StepReport, WorkerError> {
    let config = worker.config();
    let relay: Arc<dyn ProgressRelay> = worker.clone();
    let heartbeat = Heartbeat::new(relay, config.update_interval, config.task_timeout);

    let mut result = TaskAttemptResult::for_attempt(&attempt);
    let mut runner = TaskRunner::new(worker.registry().clone(), worker.blobs().clone(), attempt)
        .with_progress_sink(Box::new(heartbeat));
    runner.run(&mut result).await;

    let superseded = runner.superseded();
    let applied = if superseded {
        tracing::warn!(
            "Attempt {}@{} superseded; discarding its result",
            result.task_id,
            result.state_counter
        );
        None
    } else {
        Some(worker.apply_results(&result).await?)
    };

    Ok(StepReport {
        task_id: result.task_id,
        outcome: result.result,
        applied,
        superseded,
        duration: result.duration,
    })
}

/// Claim and run one attempt. Returns `None` when nothing is claimable.
pub async fn run_next(
    worker: &Arc<TaskWorker>,
    opts: &LoopOptions,
) -> Result<Option<StepReport>, WorkerError> {
    let Some(attempt) = worker.claim(&opts.profile, opts.queued).await? else {
        return Ok(None);
    };
    run_attempt(worker, attempt).await.map(Some)
}

/// Run attempts until the queue is empty (or forever, when polling).
///
/// An attempt this worker held before a restart is finished first.
pub async fn run_loop(worker: Arc<TaskWorker>, opts: LoopOptions) -> Result<LoopExit, WorkerError> {
    tracing::info!(
        "Worker {} serving profile {}{}",
        worker.worker_id(),
        opts.profile,
        if opts.queued { " (queued)" } else { "" }
    );

    if let Some(attempt) = worker.resume().await? {
        if run_attempt(&worker, attempt).await?.superseded {
            return Ok(LoopExit::Superseded);
        }
    }

    let mut completed = 0usize;
    loop {
        match run_next(&worker, &opts).await? {
            Some(report) => {
                if report.superseded {
                    return Ok(LoopExit::Superseded);
                }
                completed += 1;
            }
            None => match opts.poll_interval {
                Some(interval) => {
                    tracing::debug!("Queue empty; polling again in {:?}", interval);
                    tokio::time::sleep(interval).await;
                }
                None => {
                    tracing::info!(
                        "Queue for {} empty after {} attempts; exiting",
                        opts.profile,
                        completed
                    );
                    return Ok(LoopExit::Idle);
                }
            },
        }
    }
}
