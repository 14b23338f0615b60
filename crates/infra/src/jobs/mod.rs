//! Durable job records and the execution queue.
//!
//! ## Design
//!
//! - Job records describe recurring (import) or one-shot (parsing) work
//! - Queue entries dispatch one run of a record to exactly one worker
//! - All coordination goes through committed store state; there is no
//!   in-memory queue
//! - Claiming and enqueueing are atomic in every store implementation
//!
//! ## Components
//!
//! - `JobRecord` / `QueueEntry`: data model and pure transitions
//! - `JobStore`: a worker's private session (in-memory or Postgres)
//! - `SessionFactory`: opens sessions for worker instances
//! - `BackoffPolicy`: capped exponential retry delay for recurring jobs

pub mod postgres;
pub mod store;
pub mod types;

pub use postgres::{PostgresSession, PostgresSessionFactory};
pub use store::{
    EnqueueOutcome, InMemoryJobStore, InMemorySession, JobStore, QueueStats, SessionCounters,
    SessionFactory, StoreError,
};
pub use types::{
    BackoffPolicy, ImportRun, JobFamily, JobRecord, JobStatus, ParseOutcome, ParseSummary,
    QueueEntry, QueueStatus, RunHistory, RunSummary,
};
