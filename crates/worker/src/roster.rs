//! Wiring of the worker roster and the job store from [`Settings`].

use std::sync::Arc;

use anyhow::Context;
use tracing::warn;

use mailledger_infra::collaborator::{CollaboratorError, DomainCollaborator, ExecutionReport};
use mailledger_infra::config::Settings;
use mailledger_infra::jobs::{
    InMemoryJobStore, JobFamily, JobRecord, PostgresSessionFactory, SessionFactory,
};
use mailledger_infra::workers::{
    ImportWorker, JobDetector, ManagerSettings, ParsingWorker, RuntimeSettings, Worker,
    WorkerManager, WorkerSpec,
};

/// Stand-in for a domain service this process was started without.
///
/// Every job it receives fails, so records back off instead of being lost.
#[derive(Debug, Clone)]
pub struct UnconfiguredCollaborator {
    service: &'static str,
}

impl UnconfiguredCollaborator {
    pub fn new(service: &'static str) -> Self {
        Self { service }
    }
}

impl DomainCollaborator for UnconfiguredCollaborator {
    fn execute(&self, job: &JobRecord) -> Result<ExecutionReport, CollaboratorError> {
        warn!(service = self.service, job_id = %job.id, "no collaborator configured");
        Err(CollaboratorError::Unavailable(format!(
            "{} is not configured",
            self.service
        )))
    }
}

/// Domain services the processing workers delegate to.
#[derive(Clone)]
pub struct Collaborators {
    pub import: Arc<dyn DomainCollaborator>,
    pub parsing: Arc<dyn DomainCollaborator>,
}

impl Collaborators {
    pub fn unconfigured() -> Self {
        Self {
            import: Arc::new(UnconfiguredCollaborator::new("mail provider client")),
            parsing: Arc::new(UnconfiguredCollaborator::new("transaction extractor")),
        }
    }
}

fn runtime(settings: &Settings, sleep_interval: std::time::Duration) -> RuntimeSettings {
    RuntimeSettings::new(sleep_interval)
        .with_max_consecutive_errors(settings.max_consecutive_errors)
        .with_health_timeout(settings.health_timeout)
}

/// The four workers of the system: a detector and a processor per family.
pub fn build_roster(settings: &Settings, collaborators: &Collaborators) -> Vec<WorkerSpec> {
    let detector = |family: JobFamily, interval| {
        let settings = settings.clone();
        let name = format!("{}_detector", family.queue_name());
        WorkerSpec::new(name, runtime(&settings, interval), move || {
            Box::new(JobDetector::new(family, &settings)) as Box<dyn Worker>
        })
    };

    let import = {
        let settings = settings.clone();
        let collaborator = Arc::clone(&collaborators.import);
        WorkerSpec::new(
            "email_import_worker",
            runtime(&settings, settings.import_worker_interval),
            move || Box::new(ImportWorker::new(Arc::clone(&collaborator), &settings)) as Box<dyn Worker>,
        )
    };

    let parsing = {
        let settings = settings.clone();
        let collaborator = Arc::clone(&collaborators.parsing);
        WorkerSpec::new(
            "email_parsing_worker",
            runtime(&settings, settings.parsing_worker_interval),
            move || Box::new(ParsingWorker::new(Arc::clone(&collaborator), &settings)) as Box<dyn Worker>,
        )
    };

    vec![
        detector(JobFamily::Import, settings.import_detector_interval),
        import,
        detector(JobFamily::Parsing, settings.parsing_detector_interval),
        parsing,
    ]
}

/// Postgres when `USE_PERSISTENT_STORES=true`, otherwise the in-memory store.
pub fn session_factory(settings: &Settings) -> anyhow::Result<Arc<dyn SessionFactory>> {
    if !settings.use_persistent_stores {
        warn!("USE_PERSISTENT_STORES not set; jobs live in memory and are lost on exit");
        return Ok(Arc::new(InMemoryJobStore::new()));
    }

    let url = settings
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set when USE_PERSISTENT_STORES=true")?;
    let factory = PostgresSessionFactory::new(url);
    if settings.apply_schema {
        factory.apply_schema().context("failed to apply job schema")?;
    }
    Ok(Arc::new(factory))
}

pub fn build_manager(
    settings: &Settings,
    sessions: Arc<dyn SessionFactory>,
    collaborators: &Collaborators,
) -> WorkerManager {
    WorkerManager::new(
        sessions,
        ManagerSettings::from(settings),
        build_roster(settings, collaborators),
    )
}
