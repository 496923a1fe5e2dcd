//! Errors raised by domain validation.

use thiserror::Error;

use crate::job::{JobKind, JobState};

/// Rejected enqueue arguments or catalogue definitions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("payload for {kind} must be a JSON object or null")]
    PayloadNotObject { kind: JobKind },

    #[error("payload for {kind} is missing `{field}`")]
    MissingField { kind: JobKind, field: &'static str },

    #[error("payload for {kind} has invalid `{field}`: expected {expected}")]
    InvalidField {
        kind: JobKind,
        field: &'static str,
        expected: &'static str,
    },

    #[error("invalid cron expression `{expression}`: {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("cron expression `{expression}` has no upcoming fire time")]
    NoUpcomingFireTime { expression: String },

    #[error("invalid UTC offset: {offset_secs}s")]
    InvalidOffset { offset_secs: i32 },
}

/// A state change the job state machine does not allow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("job {job_id} cannot move from {from} to {to}")]
pub struct TransitionError {
    pub job_id: String,
    pub from: JobState,
    pub to: JobState,
}
