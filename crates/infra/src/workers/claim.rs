//! Claim and release steps shared by the processing workers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use mailledger_core::WorkerId;

use super::WorkerError;
use crate::jobs::{JobFamily, JobRecord, JobStore, QueueEntry, types::WORKER_LOST_MESSAGE};

pub const INVALID_JOB_DATA: &str = "Invalid job data";
pub const RECORD_NOT_FOUND: &str = "Job record not found";
pub const FAMILY_MISMATCH: &str = "Job record belongs to another queue";

/// A claimed entry and its record, both marked running by the claimer.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    pub entry: QueueEntry,
    pub record: JobRecord,
}

/// Claim the next entry of `family`'s queue and take ownership of its record.
///
/// An entry whose payload does not resolve to a record of `family` is failed
/// and `None` is returned; the next cycle moves on to the following entry.
pub fn claim_job(
    session: &mut dyn JobStore,
    family: JobFamily,
    worker: WorkerId,
    now: DateTime<Utc>,
    job_timeout: Duration,
) -> Result<Option<ClaimedJob>, WorkerError> {
    let Some(entry) = session.claim_next(family.queue_name(), worker, now, job_timeout)? else {
        return Ok(None);
    };
    session.commit()?;

    let record = match entry.job_record_id() {
        Ok(id) => session.get_record(id)?,
        Err(err) => {
            warn!(entry_id = %entry.id, error = %err, "queue entry has no usable job reference");
            return reject(session, entry, INVALID_JOB_DATA, now);
        }
    };

    let mut record = match record {
        Some(record) if record.family == family => record,
        Some(record) => {
            warn!(entry_id = %entry.id, job_id = %record.id, family = %record.family, "queue entry references a job of another family");
            return reject(session, entry, FAMILY_MISMATCH, now);
        }
        None => {
            warn!(entry_id = %entry.id, "queue entry references a missing job record");
            return reject(session, entry, RECORD_NOT_FOUND, now);
        }
    };

    record.mark_running(worker, now, job_timeout);
    session.update_record(&record)?;
    session.commit()?;

    Ok(Some(ClaimedJob { entry, record }))
}

fn reject(
    session: &mut dyn JobStore,
    mut entry: QueueEntry,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<Option<ClaimedJob>, WorkerError> {
    entry.mark_failed(reason, now);
    session.update_entry(&entry)?;
    session.commit()?;
    Ok(None)
}

/// Close out everything `owner` left running on `family`'s queue.
///
/// Running records are abandoned (failed or errored by family) and running
/// entries are failed. Returns the number of records released.
pub fn abandon_owned(
    session: &mut dyn JobStore,
    family: JobFamily,
    owner: WorkerId,
    now: DateTime<Utc>,
) -> Result<usize, WorkerError> {
    let records = session.list_owned_running(family, owner)?;
    for mut record in records.iter().cloned() {
        record.mark_abandoned(now);
        session.update_record(&record)?;
    }

    let entries = session.list_owned_entries(family.queue_name(), owner)?;
    for mut entry in entries.iter().cloned() {
        entry.mark_failed(WORKER_LOST_MESSAGE, now);
        session.update_entry(&entry)?;
    }

    if !records.is_empty() || !entries.is_empty() {
        info!(
            queue = family.queue_name(),
            owner = %owner,
            records = records.len(),
            entries = entries.len(),
            "released in-flight jobs"
        );
    }
    Ok(records.len())
}
