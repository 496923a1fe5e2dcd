//! Repository implementations for broker operations.

mod event_repo;
mod job_repo;
mod lock_repo;
mod schedule_repo;
mod worker_repo;

pub use event_repo::{EventFeed, EventRepository, PublishedEvent};
pub use job_repo::{JobFilter, JobRepository, StateChange};
pub use lock_repo::{LockHolder, LockRepository};
pub use schedule_repo::ScheduleRepository;
pub use worker_repo::WorkerRepository;
