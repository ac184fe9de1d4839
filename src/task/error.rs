//! Attempt error types with retry classification.
//!
//! Everything that goes wrong inside one attempt ends up as an
//! [`AttemptError`]. The runner folds it into an `error` result, tagging it
//! with an [`ErrorKind`] so the worker can tell broken task logic apart from
//! an attempt that legitimately failed.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::blob::BlobError;

/// Classification of attempt errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// External or transient failure - retrying may help
    Retryable,
    /// The task broke a runner invariant - retrying runs the same bug again
    FatalInvariant,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Retryable)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Retryable => write!(f, "retryable"),
            ErrorKind::FatalInvariant => write!(f, "fatal invariant"),
        }
    }
}

/// Errors raised while executing one attempt.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("invalid progress {value}: must be in [0, 1] and not below {last}")]
    InvalidProgress { value: f64, last: f64 },

    #[error("invalid progress split cur_part={cur_part}, future_part={future_part}: {reason}")]
    InvalidSplit {
        cur_part: f64,
        future_part: f64,
        reason: &'static str,
    },

    #[error("step set an output and also created {count} subtasks")]
    OutputWithSubtasks { count: usize },

    #[error("unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("output of subtask {0} is not available")]
    MissingSubtaskOutput(usize),

    #[error("attempt superseded: the task has moved on")]
    Superseded,

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error(transparent)]
    Task(#[from] anyhow::Error),
}

impl AttemptError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AttemptError::InvalidProgress { .. }
            | AttemptError::InvalidSplit { .. }
            | AttemptError::OutputWithSubtasks { .. }
            | AttemptError::UnknownTaskType(_)
            | AttemptError::MissingSubtaskOutput(_) => ErrorKind::FatalInvariant,
            AttemptError::Superseded
            | AttemptError::Panicked(_)
            | AttemptError::Blob(_)
            | AttemptError::Task(_) => ErrorKind::Retryable,
        }
    }

    /// Recover a typed error that travelled through a task body as
    /// `anyhow::Error`.
    pub fn from_task_error(err: anyhow::Error) -> Self {
        match err.downcast::<AttemptError>() {
            Ok(typed) => typed,
            Err(other) => AttemptError::Task(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invariant_errors_are_fatal() {
        let err = AttemptError::InvalidProgress {
            value: 1.5,
            last: 0.0,
        };
        assert_eq!(err.kind(), ErrorKind::FatalInvariant);
        assert!(!err.kind().is_retryable());
        assert_eq!(
            AttemptError::UnknownTaskType("x".into()).kind(),
            ErrorKind::FatalInvariant
        );
    }

    #[test]
    fn test_task_errors_are_retryable() {
        let err = AttemptError::Task(anyhow::anyhow!("disk full"));
        assert_eq!(err.kind(), ErrorKind::Retryable);
        assert_eq!(err.to_string(), "disk full");
    }

    #[test]
    fn test_from_task_error_recovers_typed_error() {
        let wrapped: anyhow::Error = AttemptError::MissingSubtaskOutput(3).into();
        let recovered = AttemptError::from_task_error(wrapped);
        assert!(matches!(recovered, AttemptError::MissingSubtaskOutput(3)));

        let plain = AttemptError::from_task_error(anyhow::anyhow!("boom"));
        assert!(matches!(plain, AttemptError::Task(_)));
    }
}
