//! Job storage boundary and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

use mailledger_core::{DomainError, JobRecordId, QueueEntryId, WorkerId};

use super::types::{JobFamily, JobRecord, JobStatus, QueueEntry, QueueStatus};

/// A worker's private session against the job store.
///
/// Sessions are never shared between workers. Writes become visible to other
/// sessions on [`JobStore::commit`]; `enqueue` and `claim_next` are atomic with
/// respect to concurrent sessions.
pub trait JobStore: Send {
    /// Insert a new job record.
    fn insert_record(&mut self, record: &JobRecord) -> Result<(), StoreError>;

    /// Get a job record by ID.
    fn get_record(&mut self, id: JobRecordId) -> Result<Option<JobRecord>, StoreError>;

    /// Overwrite an existing job record.
    fn update_record(&mut self, record: &JobRecord) -> Result<(), StoreError>;

    /// Records of `family` a detector may enqueue at `now`, oldest first.
    fn list_eligible(
        &mut self,
        family: JobFamily,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError>;

    /// Running records of `family` owned by `owner`.
    fn list_owned_running(
        &mut self,
        family: JobFamily,
        owner: WorkerId,
    ) -> Result<Vec<JobRecord>, StoreError>;

    /// `queued` records of `family` with no pending or running entry.
    fn list_orphaned_queued(&mut self, family: JobFamily) -> Result<Vec<JobRecord>, StoreError>;

    /// Get a queue entry by ID.
    fn get_entry(&mut self, id: QueueEntryId) -> Result<Option<QueueEntry>, StoreError>;

    /// Overwrite an existing queue entry.
    fn update_entry(&mut self, entry: &QueueEntry) -> Result<(), StoreError>;

    /// Running entries on `queue_name` owned by `owner`.
    fn list_owned_entries(
        &mut self,
        queue_name: &str,
        owner: WorkerId,
    ) -> Result<Vec<QueueEntry>, StoreError>;

    /// Atomically dispatch `record`: unless a live entry already references it,
    /// flip the stored record to `queued` (only if it is still eligible at
    /// `now`) and insert `entry`.
    fn enqueue(
        &mut self,
        record: &JobRecord,
        entry: &QueueEntry,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, StoreError>;

    /// Atomically claim the next pending entry on `queue_name`
    /// (highest priority first, then oldest).
    ///
    /// Returns `None` when nothing is pending or every candidate was claimed
    /// by a concurrent session.
    fn claim_next(
        &mut self,
        queue_name: &str,
        worker: WorkerId,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<QueueEntry>, StoreError>;

    /// Entry counts per status on `queue_name`.
    fn queue_stats(&mut self, queue_name: &str) -> Result<QueueStats, StoreError>;

    /// Make this session's writes durable and visible.
    fn commit(&mut self) -> Result<(), StoreError>;

    /// Discard uncommitted writes.
    fn rollback(&mut self) -> Result<(), StoreError>;

    /// Release the session's connection. Further calls fail.
    fn close(&mut self) -> Result<(), StoreError>;
}

/// Opens private sessions; one per worker instance.
pub trait SessionFactory: Send + Sync {
    fn open(&self) -> Result<Box<dyn JobStore>, StoreError>;
}

/// Result of [`JobStore::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Record flipped to `queued` and a pending entry inserted.
    Enqueued,
    /// A pending or running entry already references the record.
    AlreadyQueued,
    /// The stored record is no longer eligible (another detector won, or it changed).
    NotEligible,
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    /// Serialization failure, deadlock, or a poisoned transaction.
    #[error("session conflict: {0}")]
    SessionConflict(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn record_not_found(id: JobRecordId) -> Self {
        Self::NotFound {
            entity: "job record",
            id: id.to_string(),
        }
    }

    pub fn entry_not_found(id: QueueEntryId) -> Self {
        Self::NotFound {
            entity: "queue entry",
            id: id.to_string(),
        }
    }

    /// Whether the session should be discarded and reopened rather than rolled back.
    pub fn needs_refresh(&self) -> bool {
        matches!(self, StoreError::SessionConflict(_) | StoreError::Connection(_))
    }
}

impl From<DomainError> for StoreError {
    fn from(err: DomainError) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub expired: usize,
}

impl QueueStats {
    fn count(&mut self, status: QueueStatus) {
        match status {
            QueueStatus::Pending => self.pending += 1,
            QueueStatus::Running => self.running += 1,
            QueueStatus::Completed => self.completed += 1,
            QueueStatus::Failed => self.failed += 1,
            QueueStatus::Expired => self.expired += 1,
        }
    }
}

/// Session lifecycle counters, for tests and diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct SessionCounters {
    pub opened: u64,
    pub commits: u64,
    pub rollbacks: u64,
    pub closes: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    records: HashMap<JobRecordId, JobRecord>,
    entries: HashMap<QueueEntryId, QueueEntry>,
}

impl MemoryState {
    fn has_live_entry(&self, record_id: JobRecordId) -> bool {
        self.entries.values().any(|e| {
            e.status.is_live() && e.job_record_id().is_ok_and(|id| id == record_id)
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory job store for tests/dev.
///
/// Every session operates directly on shared state under one lock, so each
/// call is atomic on its own; `commit` and `rollback` only bump counters.
#[derive(Debug, Clone, Default)]
pub struct InMemoryJobStore {
    state: Arc<Mutex<MemoryState>>,
    counters: Arc<Mutex<SessionCounters>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session on the shared state.
    pub fn session(&self) -> InMemorySession {
        lock(&self.counters).opened += 1;
        InMemorySession {
            store: self.clone(),
            closed: false,
        }
    }

    pub fn counters(&self) -> SessionCounters {
        lock(&self.counters).clone()
    }

    /// Insert an entry as-is, bypassing the enqueue checks.
    pub fn insert_entry(&self, entry: QueueEntry) {
        lock(&self.state).entries.insert(entry.id, entry);
    }

    pub fn record(&self, id: JobRecordId) -> Option<JobRecord> {
        lock(&self.state).records.get(&id).cloned()
    }

    pub fn entries(&self) -> Vec<QueueEntry> {
        let mut entries: Vec<_> = lock(&self.state).entries.values().cloned().collect();
        entries.sort_by_key(|e| (e.created_at, e.id));
        entries
    }

    /// Entries whose payload references `record_id`.
    pub fn entries_for(&self, record_id: JobRecordId) -> Vec<QueueEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.job_record_id().is_ok_and(|id| id == record_id))
            .collect()
    }
}

impl SessionFactory for InMemoryJobStore {
    fn open(&self) -> Result<Box<dyn JobStore>, StoreError> {
        Ok(Box::new(self.session()))
    }
}

/// A session on an [`InMemoryJobStore`].
#[derive(Debug)]
pub struct InMemorySession {
    store: InMemoryJobStore,
    closed: bool,
}

impl InMemorySession {
    fn state(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        if self.closed {
            return Err(StoreError::Connection("session closed".to_string()));
        }
        Ok(lock(&self.store.state))
    }
}

impl JobStore for InMemorySession {
    fn insert_record(&mut self, record: &JobRecord) -> Result<(), StoreError> {
        let mut state = self.state()?;
        if state.records.contains_key(&record.id) {
            return Err(StoreError::Storage(format!("job record already exists: {}", record.id)));
        }
        state.records.insert(record.id, record.clone());
        Ok(())
    }

    fn get_record(&mut self, id: JobRecordId) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.state()?.records.get(&id).cloned())
    }

    fn update_record(&mut self, record: &JobRecord) -> Result<(), StoreError> {
        let mut state = self.state()?;
        match state.records.get_mut(&record.id) {
            Some(stored) => {
                *stored = record.clone();
                Ok(())
            }
            None => Err(StoreError::record_not_found(record.id)),
        }
    }

    fn list_eligible(
        &mut self,
        family: JobFamily,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let state = self.state()?;
        let mut result: Vec<_> = state
            .records
            .values()
            .filter(|r| r.family == family && r.is_eligible(now))
            .cloned()
            .collect();

        result.sort_by_key(|r| (r.created_at, r.id));
        result.truncate(limit);
        Ok(result)
    }

    fn list_owned_running(
        &mut self,
        family: JobFamily,
        owner: WorkerId,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let state = self.state()?;
        Ok(state
            .records
            .values()
            .filter(|r| {
                r.family == family && r.status == JobStatus::Running && r.worker_id == Some(owner)
            })
            .cloned()
            .collect())
    }

    fn list_orphaned_queued(&mut self, family: JobFamily) -> Result<Vec<JobRecord>, StoreError> {
        let state = self.state()?;
        Ok(state
            .records
            .values()
            .filter(|r| {
                r.family == family && r.status == JobStatus::Queued && !state.has_live_entry(r.id)
            })
            .cloned()
            .collect())
    }

    fn get_entry(&mut self, id: QueueEntryId) -> Result<Option<QueueEntry>, StoreError> {
        Ok(self.state()?.entries.get(&id).cloned())
    }

    fn update_entry(&mut self, entry: &QueueEntry) -> Result<(), StoreError> {
        let mut state = self.state()?;
        match state.entries.get_mut(&entry.id) {
            Some(stored) => {
                *stored = entry.clone();
                Ok(())
            }
            None => Err(StoreError::entry_not_found(entry.id)),
        }
    }

    fn list_owned_entries(
        &mut self,
        queue_name: &str,
        owner: WorkerId,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        let state = self.state()?;
        Ok(state
            .entries
            .values()
            .filter(|e| {
                e.queue_name == queue_name
                    && e.status == QueueStatus::Running
                    && e.worker_id == Some(owner)
            })
            .cloned()
            .collect())
    }

    fn enqueue(
        &mut self,
        record: &JobRecord,
        entry: &QueueEntry,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, StoreError> {
        let mut state = self.state()?;
        if state.has_live_entry(record.id) {
            return Ok(EnqueueOutcome::AlreadyQueued);
        }

        let stored = state
            .records
            .get_mut(&record.id)
            .ok_or_else(|| StoreError::record_not_found(record.id))?;
        if !stored.is_eligible(now) {
            return Ok(EnqueueOutcome::NotEligible);
        }
        stored.mark_queued(now);

        state.entries.insert(entry.id, entry.clone());
        Ok(EnqueueOutcome::Enqueued)
    }

    fn claim_next(
        &mut self,
        queue_name: &str,
        worker: WorkerId,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<QueueEntry>, StoreError> {
        let mut state = self.state()?;

        let next = state
            .entries
            .values()
            .filter(|e| {
                e.queue_name == queue_name
                    && e.status == QueueStatus::Pending
                    && e.scheduled_at <= now
            })
            .min_by_key(|e| (std::cmp::Reverse(e.priority), e.created_at, e.id))
            .map(|e| e.id);

        Ok(next.and_then(|id| {
            state.entries.get_mut(&id).map(|entry| {
                entry.mark_claimed(worker, now, lease);
                entry.clone()
            })
        }))
    }

    fn queue_stats(&mut self, queue_name: &str) -> Result<QueueStats, StoreError> {
        let state = self.state()?;
        let mut stats = QueueStats::default();
        for entry in state.entries.values().filter(|e| e.queue_name == queue_name) {
            stats.count(entry.status);
        }
        Ok(stats)
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.state()?;
        lock(&self.store.counters).commits += 1;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        self.state()?;
        lock(&self.store.counters).rollbacks += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), StoreError> {
        if !self.closed {
            self.closed = true;
            lock(&self.store.counters).closes += 1;
        }
        Ok(())
    }
}
