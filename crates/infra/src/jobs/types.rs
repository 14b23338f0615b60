//! Job records, queue entries, and the pure state transitions between them.
//!
//! Every transition takes `now` explicitly so workers and tests agree on a
//! single clock reading per cycle.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use mailledger_core::{DomainError, DomainResult, JobRecordId, QueueEntryId, WorkerId};

/// Maximum number of run summaries kept on a job record.
pub const RUN_HISTORY_LIMIT: usize = 50;

/// Payload key linking a queue entry back to its job record.
pub const JOB_RECORD_KEY: &str = "job_record_id";

/// Default number of attempts a queue entry allows.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Message written to jobs whose owning worker disappeared mid-run.
pub const WORKER_LOST_MESSAGE: &str = "Worker stopped unexpectedly";

/// `at + delay`, saturating at the latest representable instant.
pub(crate) fn offset(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

macro_rules! text_enum {
    ($t:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $t {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(DomainError::unknown_variant($kind, other)),
                }
            }
        }
    };
}

/// Lifecycle state of a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    Idle,
    Ready,
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Error,
    Expired,
    Suspended,
}

text_enum!(JobStatus, "job status", {
    Waiting => "waiting",
    Idle => "idle",
    Ready => "ready",
    Pending => "pending",
    Queued => "queued",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Error => "error",
    Expired => "expired",
    Suspended => "suspended",
});

/// Lifecycle state of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Expired,
}

text_enum!(QueueStatus, "queue status", {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Expired => "expired",
});

impl QueueStatus {
    /// Pending and running entries still hold their job record's single slot.
    pub fn is_live(&self) -> bool {
        matches!(self, QueueStatus::Pending | QueueStatus::Running)
    }
}

/// Kind of work a job record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobFamily {
    /// Recurring mailbox import for one integration.
    Import,
    /// One-shot parse/extract of a single email.
    Parsing,
}

text_enum!(JobFamily, "job family", {
    Import => "import",
    Parsing => "parsing",
});

impl JobFamily {
    /// Queue (and job type) the family's entries are dispatched on.
    pub fn queue_name(&self) -> &'static str {
        match self {
            JobFamily::Import => "email_import",
            JobFamily::Parsing => "email_parsing",
        }
    }

    /// Statuses from which a record of this family may be enqueued.
    pub fn eligible_statuses(&self) -> &'static [JobStatus] {
        match self {
            JobFamily::Import => &[
                JobStatus::Completed,
                JobStatus::Failed,
                JobStatus::Idle,
                JobStatus::Ready,
                JobStatus::Pending,
            ],
            JobFamily::Parsing => &[JobStatus::Pending],
        }
    }

    /// Whether eligibility additionally requires `next_run_at <= now`.
    pub fn is_time_gated(&self) -> bool {
        matches!(self, JobFamily::Import)
    }

    /// Status an orphaned `queued` record returns to.
    pub fn released_status(&self) -> JobStatus {
        match self {
            JobFamily::Import => JobStatus::Idle,
            JobFamily::Parsing => JobStatus::Pending,
        }
    }
}

/// Terminal outcome class of a parsing job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseSummary {
    TransactionCreated,
    NoBankIdentified,
    NoTemplatesConfigured,
    NoTransactionFound,
    ProcessingError,
    WorkerStopped,
}

text_enum!(ParseSummary, "parse summary", {
    TransactionCreated => "transaction_created",
    NoBankIdentified => "no_bank_identified",
    NoTemplatesConfigured => "no_templates_configured",
    NoTransactionFound => "no_transaction_found",
    ProcessingError => "processing_error",
    WorkerStopped => "worker_stopped",
});

/// One execution summary appended to a job record's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub timestamp: DateTime<Utc>,
    pub emails_found: u32,
    pub emails_processed: u32,
    pub duration_secs: f64,
    pub worker_id: WorkerId,
}

/// Bounded run history, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunHistory(Vec<RunSummary>);

impl RunHistory {
    /// Append a summary, evicting the oldest ones beyond [`RUN_HISTORY_LIMIT`].
    pub fn push(&mut self, summary: RunSummary) {
        self.0.push(summary);
        if self.0.len() > RUN_HISTORY_LIMIT {
            let excess = self.0.len() - RUN_HISTORY_LIMIT;
            self.0.drain(..excess);
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RunSummary> {
        self.0.iter()
    }

    pub fn latest(&self) -> Option<&RunSummary> {
        self.0.last()
    }
}

/// Exponential backoff for recurring jobs after consecutive failures.
///
/// `delay = min(base * 2^consecutive_errors, cap)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            cap: Duration::from_secs(120 * 60),
        }
    }
}

impl BackoffPolicy {
    pub fn with_cap(cap: Duration) -> Self {
        Self { cap }
    }

    /// Delay before the next attempt of a job that has failed
    /// `consecutive_errors` times in a row.
    pub fn delay(&self, base: Duration, consecutive_errors: u32) -> Duration {
        let factor = 1u32.checked_shl(consecutive_errors).unwrap_or(u32::MAX);
        base.checked_mul(factor).unwrap_or(Duration::MAX).min(self.cap)
    }
}

/// Counters reported by a successful import run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImportRun {
    pub emails_found: u32,
    pub emails_processed: u32,
    pub duration_secs: f64,
}

/// Conclusive result of a parsing run (created or nothing extracted).
#[derive(Debug, Clone, PartialEq)]
pub struct ParseOutcome {
    pub summary: ParseSummary,
    pub extracted_data: Option<Value>,
    pub transaction_id: Option<String>,
    pub confidence_score: Option<f64>,
    pub rules_used: Vec<String>,
    pub message: Option<String>,
}

/// A durable unit of recurring or one-shot work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobRecordId,
    pub family: JobFamily,
    pub status: JobStatus,
    pub worker_id: Option<WorkerId>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Intended deadline of the current run. Recorded only.
    pub timeout_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    /// Present iff the record is recurring.
    pub sync_interval: Option<Duration>,
    pub total_runs: u64,
    pub consecutive_errors: u32,
    pub error_message: Option<String>,
    pub run_history: RunHistory,

    // Import bookkeeping.
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_duration_secs: Option<f64>,
    pub emails_found_last_run: u32,
    pub emails_processed_last_run: u32,
    pub total_emails_processed: u64,

    // Parsing results.
    pub summary: Option<ParseSummary>,
    pub extracted_data: Option<Value>,
    pub transaction_id: Option<String>,
    pub confidence_score: Option<f64>,
    pub rules_used: Vec<String>,

    /// Domain fields (integration id, message id, ...). Opaque to the core.
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Create a one-shot record in the given initial status.
    pub fn new(family: JobFamily, status: JobStatus, now: DateTime<Utc>) -> Self {
        Self {
            id: JobRecordId::new(),
            family,
            status,
            worker_id: None,
            started_at: None,
            completed_at: None,
            timeout_at: None,
            next_run_at: None,
            sync_interval: None,
            total_runs: 0,
            consecutive_errors: 0,
            error_message: None,
            run_history: RunHistory::default(),
            last_run_at: None,
            last_run_duration_secs: None,
            emails_found_last_run: 0,
            emails_processed_last_run: 0,
            total_emails_processed: 0,
            summary: None,
            extracted_data: None,
            transaction_id: None,
            confidence_score: None,
            rules_used: Vec::new(),
            payload: Value::Object(Default::default()),
            created_at: now,
            updated_at: now,
        }
    }

    /// Create an idle recurring record that is due immediately.
    pub fn recurring(family: JobFamily, interval: Duration, now: DateTime<Utc>) -> DomainResult<Self> {
        if interval.is_zero() {
            return Err(DomainError::validation("sync interval must be greater than zero"));
        }
        let mut record = Self::new(family, JobStatus::Idle, now);
        record.sync_interval = Some(interval);
        record.next_run_at = Some(now);
        Ok(record)
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_next_run_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_run_at = Some(at);
        self
    }

    pub fn is_recurring(&self) -> bool {
        self.sync_interval.is_some()
    }

    /// Whether a detector may enqueue this record at `now`.
    ///
    /// A time-gated record without `next_run_at` counts as due.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        if !self.family.eligible_statuses().contains(&self.status) {
            return false;
        }
        !self.family.is_time_gated() || self.next_run_at.is_none_or(|at| at <= now)
    }

    pub fn mark_queued(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Queued;
        self.updated_at = now;
    }

    /// Record ownership by `worker` for a run starting at `now`.
    pub fn mark_running(&mut self, worker: WorkerId, now: DateTime<Utc>, timeout: Duration) {
        self.status = JobStatus::Running;
        self.worker_id = Some(worker);
        self.started_at = Some(now);
        self.timeout_at = Some(offset(now, timeout));
        self.updated_at = now;
    }

    /// Apply a successful import run.
    ///
    /// Recurring records go back to `pending` with `next_run_at = now + sync_interval`.
    pub fn mark_import_succeeded(&mut self, run: ImportRun, worker: WorkerId, now: DateTime<Utc>) {
        self.status = if self.is_recurring() {
            JobStatus::Pending
        } else {
            JobStatus::Completed
        };
        self.total_runs += 1;
        self.consecutive_errors = 0;
        self.error_message = None;
        self.last_run_at = Some(now);
        self.last_run_duration_secs = Some(run.duration_secs);
        self.emails_found_last_run = run.emails_found;
        self.emails_processed_last_run = run.emails_processed;
        self.total_emails_processed += u64::from(run.emails_processed);
        if let Some(interval) = self.sync_interval {
            self.next_run_at = Some(offset(now, interval));
        }
        self.run_history.push(RunSummary {
            timestamp: now,
            emails_found: run.emails_found,
            emails_processed: run.emails_processed,
            duration_secs: run.duration_secs,
            worker_id: worker,
        });
        self.release(now);
    }

    /// Apply a failed run; recurring records are pushed back by `backoff`,
    /// one-shot records by its cap.
    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>, backoff: &BackoffPolicy) {
        self.status = JobStatus::Failed;
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        self.error_message = Some(error.into());
        let delay = match self.sync_interval {
            Some(interval) => backoff.delay(interval, self.consecutive_errors),
            None => backoff.cap,
        };
        self.next_run_at = Some(offset(now, delay));
        self.release(now);
    }

    /// Apply a conclusive parse result (a transaction or a reason there is none).
    pub fn mark_parsed(&mut self, outcome: ParseOutcome, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.summary = Some(outcome.summary);
        self.extracted_data = outcome.extracted_data;
        self.transaction_id = outcome.transaction_id;
        self.confidence_score = outcome.confidence_score;
        self.rules_used = outcome.rules_used;
        self.error_message = outcome.message;
        self.total_runs += 1;
        self.consecutive_errors = 0;
        self.release(now);
    }

    /// Apply a parse run that raised an error.
    pub fn mark_parse_error(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = JobStatus::Error;
        self.summary = Some(ParseSummary::ProcessingError);
        self.error_message = Some(error.into());
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        self.release(now);
    }

    /// Close out a run whose owning worker stopped before finishing it.
    pub fn mark_abandoned(&mut self, now: DateTime<Utc>) {
        match self.family {
            JobFamily::Import => {
                self.status = JobStatus::Failed;
                self.consecutive_errors = self.consecutive_errors.saturating_add(1);
            }
            JobFamily::Parsing => {
                self.status = JobStatus::Error;
                self.summary = Some(ParseSummary::WorkerStopped);
            }
        }
        self.error_message = Some(WORKER_LOST_MESSAGE.to_string());
        self.release(now);
    }

    /// Return an orphaned `queued` record to its family's eligible state.
    pub fn release_queued(&mut self, now: DateTime<Utc>) {
        self.status = self.family.released_status();
        self.worker_id = None;
        self.updated_at = now;
    }

    fn release(&mut self, now: DateTime<Utc>) {
        self.worker_id = None;
        self.completed_at = Some(now);
        self.updated_at = now;
    }
}

/// A dispatch of one job record into the execution queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: QueueEntryId,
    pub queue_name: String,
    pub job_type: String,
    pub payload: Value,
    pub status: QueueStatus,
    /// Set iff `status` is `running`.
    pub worker_id: Option<WorkerId>,
    /// Higher runs first.
    pub priority: i32,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub result_data: Option<Value>,
    pub error_message: Option<String>,
}

impl QueueEntry {
    /// Build a pending entry dispatching `record` on its family's queue.
    pub fn for_record(record: &JobRecord, priority: i32, now: DateTime<Utc>) -> Self {
        let queue = record.family.queue_name();
        let mut payload = serde_json::Map::new();
        payload.insert(JOB_RECORD_KEY.to_string(), Value::String(record.id.to_string()));
        Self {
            id: QueueEntryId::new(),
            queue_name: queue.to_string(),
            job_type: queue.to_string(),
            payload: Value::Object(payload),
            status: QueueStatus::Pending,
            worker_id: None,
            priority,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            created_at: now,
            scheduled_at: now,
            started_at: None,
            completed_at: None,
            expires_at: None,
            result_data: None,
            error_message: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// The job record this entry dispatches.
    pub fn job_record_id(&self) -> DomainResult<JobRecordId> {
        let raw = self
            .payload
            .get(JOB_RECORD_KEY)
            .and_then(Value::as_str)
            .ok_or_else(|| DomainError::invalid_payload(format!("missing {JOB_RECORD_KEY}")))?;
        raw.parse()
    }

    /// Transition taken by a successful claim.
    pub fn mark_claimed(&mut self, worker: WorkerId, now: DateTime<Utc>, lease: Duration) {
        self.status = QueueStatus::Running;
        self.worker_id = Some(worker);
        self.started_at = Some(now);
        self.attempts = self.attempts.saturating_add(1);
        self.expires_at = Some(offset(now, lease));
    }

    pub fn mark_completed(&mut self, result: Option<Value>, now: DateTime<Utc>) {
        self.status = QueueStatus::Completed;
        self.result_data = result;
        self.worker_id = None;
        self.completed_at = Some(now);
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = QueueStatus::Failed;
        self.error_message = Some(error.into());
        self.worker_id = None;
        self.completed_at = Some(now);
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}
