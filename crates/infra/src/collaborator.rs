//! Boundary to the domain services a processing worker delegates to.
//!
//! The mail-provider client and the bank-identification/template-extraction
//! engine live behind [`DomainCollaborator`]; the job core only interprets the
//! [`ExecutionReport`] they return.

use serde::Serialize;
use serde_json::Value;

use crate::jobs::{JobRecord, ParseSummary};

/// Data produced by one execution. Which fields are set depends on the family.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emails_found: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emails_processed: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rules_used: Vec<String>,
}

/// What a collaborator reports back for one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionReport {
    pub success: bool,
    pub result: ExecutionResult,
    pub error_message: Option<String>,
    /// Why nothing was produced, for runs that ended without a result.
    pub outcome_kind: Option<ParseSummary>,
}

impl ExecutionReport {
    pub fn succeeded(result: ExecutionResult) -> Self {
        Self {
            success: true,
            result,
            error_message: None,
            outcome_kind: None,
        }
    }

    pub fn imported(emails_found: u32, emails_processed: u32) -> Self {
        Self::succeeded(ExecutionResult {
            emails_found: Some(emails_found),
            emails_processed: Some(emails_processed),
            ..ExecutionResult::default()
        })
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: ExecutionResult::default(),
            error_message: Some(message.into()),
            outcome_kind: None,
        }
    }

    /// A conclusive run that produced nothing, e.g. an unidentified bank.
    pub fn nothing_extracted(kind: ParseSummary, message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: ExecutionResult::default(),
            error_message: Some(message.into()),
            outcome_kind: Some(kind),
        }
    }
}

/// Failure raised by a collaborator instead of a report.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CollaboratorError {
    #[error("{0}")]
    Failed(String),
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
}

/// A domain service executing one job record.
pub trait DomainCollaborator: Send + Sync {
    fn execute(&self, job: &JobRecord) -> Result<ExecutionReport, CollaboratorError>;
}

impl<F> DomainCollaborator for F
where
    F: Fn(&JobRecord) -> Result<ExecutionReport, CollaboratorError> + Send + Sync,
{
    fn execute(&self, job: &JobRecord) -> Result<ExecutionReport, CollaboratorError> {
        self(job)
    }
}
