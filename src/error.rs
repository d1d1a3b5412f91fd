//! Error taxonomy for scheduling runs.
//!
//! Three classes reach the caller and drive the retry policy:
//! - [`ValidationError`]: malformed flex-model/flex-context or device data,
//!   rejected before any model is built.
//! - [`SchedulerError::Infeasible`]: proven by the solver, never retried.
//! - [`SchedulerError::Solver`]: crashes, timeouts and ambiguous outcomes.

use std::time::Duration;

use thiserror::Error;

use crate::domain::ScheduleStatus;

/// Configuration and input errors, detected before model construction.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("invalid time grid: {0}")]
    TimeGrid(String),

    #[error("invalid quantity {value:?}: {reason}")]
    Quantity { value: String, reason: String },

    #[error("field `{field}`: {reason}")]
    Field { field: String, reason: String },

    #[error("device `{device}`: {reason}")]
    Device { device: String, reason: String },

    #[error("commitment `{commitment}`: {reason}")]
    Commitment { commitment: String, reason: String },

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl ValidationError {
    pub fn field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Field {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn device(device: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Device {
            device: device.into(),
            reason: reason.into(),
        }
    }

    pub fn commitment(commitment: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Commitment {
            commitment: commitment.into(),
            reason: reason.into(),
        }
    }

    pub fn quantity(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Quantity {
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// Outcome of a failed solver invocation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SolveError {
    #[error("model is infeasible")]
    Infeasible,

    #[error("model is unbounded")]
    Unbounded,

    #[error("solver exceeded its time budget of {0:?}")]
    Timeout(Duration),

    #[error("solver failed: {0}")]
    Failed(String),
}

/// Top-level error of one scheduling run.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SchedulerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("no feasible schedule under these constraints: {0}")]
    Infeasible(String),

    #[error("scheduling failed: {0}")]
    Solver(SolveError),
}

impl SchedulerError {
    /// Only transient solver failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedulerError::Solver(SolveError::Timeout(_) | SolveError::Failed(_))
        )
    }

    /// Status signal surfaced to callers. Validation errors never reach the
    /// solver and carry no solve status.
    pub fn status(&self) -> Option<ScheduleStatus> {
        match self {
            SchedulerError::Validation(_) => None,
            SchedulerError::Infeasible(_) => Some(ScheduleStatus::Infeasible),
            SchedulerError::Solver(_) => Some(ScheduleStatus::SolverError),
        }
    }
}

impl From<SolveError> for SchedulerError {
    fn from(err: SolveError) -> Self {
        match err {
            SolveError::Infeasible => {
                SchedulerError::Infeasible("the solver proved the model infeasible".to_string())
            }
            other => SchedulerError::Solver(other),
        }
    }
}
