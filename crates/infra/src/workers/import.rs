//! Import worker: runs mailbox imports for claimed `email_import` entries.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use mailledger_core::WorkerId;

use super::WorkerError;
use super::claim::{ClaimedJob, abandon_owned, claim_job};
use super::runtime::Worker;
use crate::collaborator::DomainCollaborator;
use crate::config::Settings;
use crate::jobs::{BackoffPolicy, ImportRun, JobFamily, JobStore};

pub struct ImportWorker {
    name: String,
    collaborator: Arc<dyn DomainCollaborator>,
    job_timeout: Duration,
    backoff: BackoffPolicy,
}

impl ImportWorker {
    pub fn new(collaborator: Arc<dyn DomainCollaborator>, settings: &Settings) -> Self {
        Self {
            name: "email_import_worker".to_string(),
            collaborator,
            job_timeout: settings.job_timeout,
            backoff: settings.backoff(),
        }
    }
}

impl Worker for ImportWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn process_cycle(
        &mut self,
        session: &mut dyn JobStore,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<(), WorkerError> {
        let Some(ClaimedJob { mut entry, mut record }) =
            claim_job(session, JobFamily::Import, worker, now, self.job_timeout)?
        else {
            return Ok(());
        };
        info!(worker = %self.name, job_id = %record.id, entry_id = %entry.id, attempt = entry.attempts, "import started");

        let started = Instant::now();
        let outcome = self.collaborator.execute(&record);
        let duration_secs = started.elapsed().as_secs_f64();

        let failure = match outcome {
            Ok(report) if report.success => {
                let run = ImportRun {
                    emails_found: report.result.emails_found.unwrap_or(0),
                    emails_processed: report.result.emails_processed.unwrap_or(0),
                    duration_secs,
                };
                record.mark_import_succeeded(run, worker, now);
                entry.mark_completed(serde_json::to_value(&report.result).ok(), now);
                info!(
                    worker = %self.name,
                    job_id = %record.id,
                    emails_found = run.emails_found,
                    emails_processed = run.emails_processed,
                    duration_secs,
                    "import completed"
                );
                None
            }
            Ok(report) => Some(
                report
                    .error_message
                    .unwrap_or_else(|| "import reported failure".to_string()),
            ),
            Err(err) => Some(err.to_string()),
        };

        if let Some(message) = failure {
            record.mark_failed(message.clone(), now, &self.backoff);
            entry.mark_failed(message.clone(), now);
            warn!(
                worker = %self.name,
                job_id = %record.id,
                error = %message,
                consecutive_errors = record.consecutive_errors,
                next_run_at = ?record.next_run_at,
                "import failed"
            );
        }

        session.update_record(&record)?;
        session.update_entry(&entry)?;
        session.commit()?;
        Ok(())
    }

    fn reset_owned_jobs(
        &mut self,
        session: &mut dyn JobStore,
        owner: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<(), WorkerError> {
        abandon_owned(session, JobFamily::Import, owner, now).map(|_| ())
    }
}
