//! Detector workers: find eligible job records and dispatch them onto their
//! family's queue.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use mailledger_core::WorkerId;

use super::WorkerError;
use super::runtime::Worker;
use crate::config::Settings;
use crate::jobs::{EnqueueOutcome, JobFamily, JobStatus, JobStore, QueueEntry};

/// Enqueues eligible records of one family.
///
/// Eligibility is re-checked by the store inside each enqueue, so concurrent
/// detectors never produce two live entries for one record.
#[derive(Debug, Clone)]
pub struct JobDetector {
    family: JobFamily,
    name: String,
    batch_limit: usize,
    priority: i32,
    max_attempts: u32,
}

impl JobDetector {
    pub fn new(family: JobFamily, settings: &Settings) -> Self {
        Self {
            family,
            name: format!("{}_detector", family.queue_name()),
            batch_limit: settings.detector_batch_limit,
            priority: settings.enqueue_priority,
            max_attempts: settings.max_attempts,
        }
    }
}

impl Worker for JobDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn process_cycle(
        &mut self,
        session: &mut dyn JobStore,
        _worker: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<(), WorkerError> {
        let candidates = session.list_eligible(self.family, now, self.batch_limit)?;
        if candidates.is_empty() {
            debug!(worker = %self.name, "no eligible jobs");
            return Ok(());
        }

        let mut enqueued = 0usize;
        for record in &candidates {
            let entry = QueueEntry::for_record(record, self.priority, now)
                .with_max_attempts(self.max_attempts);

            match session.enqueue(record, &entry, now)? {
                EnqueueOutcome::Enqueued => {
                    enqueued += 1;
                    if record.status == JobStatus::Failed {
                        info!(
                            worker = %self.name,
                            job_id = %record.id,
                            consecutive_errors = record.consecutive_errors,
                            "retrying failed job"
                        );
                    } else {
                        debug!(worker = %self.name, job_id = %record.id, entry_id = %entry.id, "job enqueued");
                    }
                }
                EnqueueOutcome::AlreadyQueued => {
                    debug!(worker = %self.name, job_id = %record.id, "job already has a live queue entry");
                }
                EnqueueOutcome::NotEligible => {
                    debug!(worker = %self.name, job_id = %record.id, "job no longer eligible");
                }
            }
            session.commit()?;
        }

        if enqueued > 0 {
            let depth = session.queue_stats(self.family.queue_name())?;
            session.commit()?;
            info!(
                worker = %self.name,
                queue = self.family.queue_name(),
                enqueued,
                candidates = candidates.len(),
                pending = depth.pending,
                running = depth.running,
                "jobs enqueued"
            );
        }
        Ok(())
    }

    /// Detectors own no running jobs; they release `queued` records whose
    /// entry is gone so they become eligible again.
    fn reset_owned_jobs(
        &mut self,
        session: &mut dyn JobStore,
        _owner: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<(), WorkerError> {
        let orphans = session.list_orphaned_queued(self.family)?;
        for mut record in orphans.iter().cloned() {
            record.release_queued(now);
            session.update_record(&record)?;
        }
        if !orphans.is_empty() {
            info!(worker = %self.name, released = orphans.len(), "released orphaned queued jobs");
        }
        Ok(())
    }
}
