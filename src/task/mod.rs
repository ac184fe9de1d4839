//! Task module - the task contract, attempt records and single-attempt
//! execution.
//!
//! - [`Task`] / [`TaskContext`]: what a unit of work implements and what a
//!   running step may do
//! - [`TaskAttempt`] / [`TaskAttemptResult`]: the wire records between a
//!   worker and a runner
//! - [`TaskInfo`]: the persisted node of a job's task tree, with the pure
//!   transition functions for applying results
//! - [`TaskRunner`]: runs one attempt, never failing outward

mod attempt;
mod error;
mod heartbeat;
mod info;
mod registry;
mod runner;
pub mod task;

pub use attempt::{AttemptOutcome, SubtaskDefinition, TaskAttempt, TaskAttemptResult};
pub use error::{AttemptError, ErrorKind};
pub use heartbeat::{Heartbeat, ProgressRelay, ProgressSink, ReportInterval, SLOW_ROUND_TRIP};
pub use info::{child_id, ErrorDisposition, TaskInfo, TaskState};
pub use registry::TaskRegistry;
pub use runner::TaskRunner;
pub(crate) use runner::panic_message;
pub use task::{
    decode_state, encode_state, Requirements, Task, TaskContext, HIMEM_PROFILE, NORMAL_PROFILE,
};
