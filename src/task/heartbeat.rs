//! Rate-limited progress push-back from a running attempt to the coordinator.
//!
//! Reports are throttled to one per interval. The interval adapts to how
//! loaded the coordinator looks: a slow round trip doubles it (up to half
//! the task timeout), every fast round trip shaves one second off again
//! until it is back at the configured cadence.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::attempt::TaskAttemptResult;
use super::error::AttemptError;

/// A round trip slower than this counts as a sign of coordinator load.
pub const SLOW_ROUND_TRIP: Duration = Duration::from_secs(2);

/// Amount the interval shrinks by after each fast round trip.
const DECAY_STEP: Duration = Duration::from_secs(1);

/// Receives progress reports from a runner.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Report `progress` for the attempt behind `result`.
    ///
    /// Returns `false` once the coordinator no longer recognises the attempt.
    async fn report(
        &mut self,
        result: &TaskAttemptResult,
        progress: f64,
    ) -> Result<bool, AttemptError>;
}

/// Coordinator side of a heartbeat: applies one progress report.
#[async_trait]
pub trait ProgressRelay: Send + Sync {
    async fn relay_progress(
        &self,
        result: &TaskAttemptResult,
        progress: f64,
    ) -> anyhow::Result<bool>;
}

/// Adaptive reporting interval.
///
/// # Invariants
/// - `base <= current <= ceiling`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportInterval {
    base: Duration,
    ceiling: Duration,
    current: Duration,
}

impl ReportInterval {
    /// Start at `base`; back off to at most half of `task_timeout`.
    pub fn new(base: Duration, task_timeout: Duration) -> Self {
        let ceiling = (task_timeout / 2).max(base);
        Self {
            base,
            ceiling,
            current: base,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    /// Feed the duration of one coordinator round trip.
    pub fn record(&mut self, round_trip: Duration) {
        self.current = if round_trip > SLOW_ROUND_TRIP {
            (self.current * 2).min(self.ceiling)
        } else {
            self.current.saturating_sub(DECAY_STEP).max(self.base)
        };
    }
}

/// Throttled [`ProgressSink`] that forwards to a [`ProgressRelay`].
pub struct Heartbeat {
    relay: Arc<dyn ProgressRelay>,
    interval: ReportInterval,
    last_report: Option<Instant>,
}

impl Heartbeat {
    pub fn new(relay: Arc<dyn ProgressRelay>, update_interval: Duration, task_timeout: Duration) -> Self {
        Self {
            relay,
            interval: ReportInterval::new(update_interval, task_timeout),
            last_report: None,
        }
    }

    pub fn interval(&self) -> &ReportInterval {
        &self.interval
    }
}

#[async_trait]
impl ProgressSink for Heartbeat {
    async fn report(
        &mut self,
        result: &TaskAttemptResult,
        progress: f64,
    ) -> Result<bool, AttemptError> {
        if let Some(last) = self.last_report {
            if last.elapsed() < self.interval.current() {
                tracing::trace!("Throttled progress report for {}", result.task_id);
                return Ok(true);
            }
        }

        let started = Instant::now();
        let current = match self.relay.relay_progress(result, progress).await {
            Ok(current) => current,
            Err(e) => {
                // Heartbeats are best effort; the result still gets applied.
                tracing::warn!("Progress report for {} failed: {}", result.task_id, e);
                true
            }
        };
        let round_trip = started.elapsed();
        self.interval.record(round_trip);
        self.last_report = Some(Instant::now());

        if round_trip > SLOW_ROUND_TRIP {
            tracing::debug!(
                "Slow progress round trip ({:?}); reporting every {:?}",
                round_trip,
                self.interval.current()
            );
        }
        if !current {
            tracing::warn!(
                "Task {} step {} has moved on; abandoning attempt",
                result.task_id,
                result.state_counter
            );
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_slow_round_trips_double_up_to_ceiling() {
        let mut interval = ReportInterval::new(secs(10), secs(60));
        assert_eq!(interval.ceiling(), secs(30));

        interval.record(secs(3));
        assert_eq!(interval.current(), secs(20));
        interval.record(secs(3));
        assert_eq!(interval.current(), secs(30));
        interval.record(secs(3));
        assert_eq!(interval.current(), secs(30));
    }

    #[test]
    fn test_fast_round_trips_decay_to_base() {
        let mut interval = ReportInterval::new(secs(10), secs(60));
        interval.record(secs(5));
        assert_eq!(interval.current(), secs(20));

        interval.record(Duration::from_millis(100));
        assert_eq!(interval.current(), secs(19));
        for _ in 0..20 {
            interval.record(Duration::from_millis(100));
        }
        assert_eq!(interval.current(), secs(10));
    }

    #[test]
    fn test_ceiling_never_below_base() {
        let interval = ReportInterval::new(secs(10), secs(4));
        assert_eq!(interval.ceiling(), secs(10));
    }

    struct CountingRelay {
        calls: AtomicUsize,
        current: bool,
    }

    #[async_trait]
    impl ProgressRelay for CountingRelay {
        async fn relay_progress(
            &self,
            _result: &TaskAttemptResult,
            _progress: f64,
        ) -> anyhow::Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.current)
        }
    }

    fn result() -> TaskAttemptResult {
        let attempt = crate::task::TaskAttempt {
            task_id: "t".into(),
            state_counter: 0,
            attempt_number: 0,
            user: "u".into(),
            working_path: crate::blob::BlobPath::new("w"),
            task_type: "echo".into(),
            state_path: crate::blob::BlobPath::new("w/s"),
            subtask_outputs: vec![],
        };
        TaskAttemptResult::for_attempt(&attempt)
    }

    #[tokio::test]
    async fn test_reports_are_throttled() {
        let relay = Arc::new(CountingRelay {
            calls: AtomicUsize::new(0),
            current: true,
        });
        let mut heartbeat = Heartbeat::new(relay.clone(), secs(60), secs(600));
        let result = result();

        assert!(heartbeat.report(&result, 0.1).await.unwrap());
        assert!(heartbeat.report(&result, 0.2).await.unwrap());
        assert!(heartbeat.report(&result, 0.3).await.unwrap());
        assert_eq!(relay.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_attempt_is_reported() {
        let relay = Arc::new(CountingRelay {
            calls: AtomicUsize::new(0),
            current: false,
        });
        let mut heartbeat = Heartbeat::new(relay, secs(1), secs(10));
        assert!(!heartbeat.report(&result(), 0.5).await.unwrap());
    }
}
