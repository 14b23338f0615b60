//! Parsing worker: extracts transactions from claimed `email_parsing` entries.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, warn};

use mailledger_core::WorkerId;

use super::WorkerError;
use super::claim::{ClaimedJob, abandon_owned, claim_job};
use super::runtime::Worker;
use crate::collaborator::{DomainCollaborator, ExecutionReport};
use crate::config::Settings;
use crate::jobs::{JobFamily, JobStore, ParseOutcome, ParseSummary};

pub struct ParsingWorker {
    name: String,
    collaborator: Arc<dyn DomainCollaborator>,
    job_timeout: Duration,
}

impl ParsingWorker {
    pub fn new(collaborator: Arc<dyn DomainCollaborator>, settings: &Settings) -> Self {
        Self {
            name: "email_parsing_worker".to_string(),
            collaborator,
            job_timeout: settings.job_timeout,
        }
    }
}

/// Map a report onto a conclusive outcome, or `Err(message)` for a processing error.
fn classify(report: ExecutionReport) -> Result<ParseOutcome, String> {
    if report.success {
        return Ok(ParseOutcome {
            summary: ParseSummary::TransactionCreated,
            extracted_data: report.result.extracted_data,
            transaction_id: report.result.transaction_id,
            confidence_score: report.result.confidence_score,
            rules_used: report.result.rules_used,
            message: None,
        });
    }

    let summary = match report.outcome_kind {
        Some(ParseSummary::ProcessingError) => {
            return Err(report
                .error_message
                .unwrap_or_else(|| "parsing reported a processing error".to_string()));
        }
        Some(
            kind @ (ParseSummary::NoBankIdentified
            | ParseSummary::NoTemplatesConfigured
            | ParseSummary::NoTransactionFound),
        ) => kind,
        _ => ParseSummary::NoTransactionFound,
    };

    Ok(ParseOutcome {
        summary,
        extracted_data: report.result.extracted_data,
        transaction_id: None,
        confidence_score: report.result.confidence_score,
        rules_used: report.result.rules_used,
        message: report.error_message,
    })
}

impl Worker for ParsingWorker {
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
            claim_job(session, JobFamily::Parsing, worker, now, self.job_timeout)?
        else {
            return Ok(());
        };
        info!(worker = %self.name, job_id = %record.id, entry_id = %entry.id, "parsing started");

        let outcome = self
            .collaborator
            .execute(&record)
            .map_err(|err| err.to_string())
            .and_then(classify);

        match outcome {
            Ok(parsed) => {
                let summary = parsed.summary;
                let result = json!({
                    "summary": summary,
                    "transaction_id": parsed.transaction_id,
                    "confidence_score": parsed.confidence_score,
                });
                record.mark_parsed(parsed, now);
                entry.mark_completed(Some(result), now);
                info!(worker = %self.name, job_id = %record.id, summary = %summary, "parsing completed");
            }
            Err(message) => {
                record.mark_parse_error(message.clone(), now);
                entry.mark_failed(message.clone(), now);
                warn!(worker = %self.name, job_id = %record.id, error = %message, "parsing failed");
            }
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
        abandon_owned(session, JobFamily::Parsing, owner, now).map(|_| ())
    }
}
