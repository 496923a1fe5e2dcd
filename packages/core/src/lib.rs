//! Core domain types for the background job subsystem.
//!
//! This crate contains shared types used across all packages:
//! - Job, JobKind and the JobState machine for work items
//! - Cron definitions and scheduled entries
//! - Channels and events for real-time updates

mod error;
mod events;
mod job;
mod schedule;

pub use error::{TransitionError, ValidationError};
pub use events::{Channel, JobEvent};
pub use job::{
    DependencyPolicy, EnqueueMode, EnqueueRequest, Job, JobId, JobKind, JobState, JobStatus,
    JobView,
};
pub use schedule::{
    CronDefinition, DEFAULT_CRON_OFFSET_SECS, Recurrence, ScheduledEntry, parse_expression,
};
