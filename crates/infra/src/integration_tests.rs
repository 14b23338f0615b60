//! Integration tests for the full job pipeline on the in-memory store.
//!
//! Tests: JobRecord → Detector → QueueEntry → Processing worker → outcome
//!
//! Verifies:
//! - Recurring imports cycle back to an eligible state on schedule
//! - Failures back off and are retried by the detector
//! - Concurrent workers never process one entry twice
//! - The manager runs the whole roster against a shared store

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;

    use mailledger_core::WorkerId;

    use crate::collaborator::{
        CollaboratorError, DomainCollaborator, ExecutionReport, ExecutionResult,
    };
    use crate::config::Settings;
    use crate::jobs::{
        InMemoryJobStore, JobFamily, JobRecord, JobStatus, JobStore, ParseSummary, QueueStatus,
    };
    use crate::workers::test_support::{ScriptedCollaborator, t0, wait_until};
    use crate::workers::{
        ImportWorker, JobDetector, ManagerSettings, ParsingWorker, RuntimeSettings, Worker,
        WorkerManager, WorkerSpec,
    };

    const TEN_MINUTES: Duration = Duration::from_secs(600);

    fn minutes(n: i64) -> chrono::Duration {
        chrono::Duration::minutes(n)
    }

    #[test]
    fn recurring_import_runs_again_after_its_interval() {
        let store = InMemoryJobStore::new();
        let settings = Settings::default();
        let record = JobRecord::recurring(JobFamily::Import, TEN_MINUTES, t0()).unwrap();
        store.session().insert_record(&record).unwrap();

        let collaborator = Arc::new(ScriptedCollaborator::always(Ok(ExecutionReport::imported(3, 3))));
        let mut detector = JobDetector::new(JobFamily::Import, &settings);
        let mut worker = ImportWorker::new(collaborator.clone(), &settings);
        let id = WorkerId::new();
        let mut session = store.session();

        detector.process_cycle(&mut session, id, t0()).unwrap();
        worker.process_cycle(&mut session, id, t0()).unwrap();

        let after_first = store.record(record.id).unwrap();
        assert_eq!(after_first.status, JobStatus::Pending);
        assert_eq!(after_first.next_run_at, Some(t0() + minutes(10)));

        // Not due yet.
        detector.process_cycle(&mut session, id, t0() + minutes(5)).unwrap();
        assert_eq!(store.entries_for(record.id).len(), 1);

        detector.process_cycle(&mut session, id, t0() + minutes(10)).unwrap();
        worker.process_cycle(&mut session, id, t0() + minutes(10)).unwrap();

        let after_second = store.record(record.id).unwrap();
        assert_eq!(after_second.total_runs, 2);
        assert_eq!(after_second.total_emails_processed, 6);
        assert_eq!(after_second.run_history.len(), 2);
        assert_eq!(after_second.next_run_at, Some(t0() + minutes(20)));

        let entries = store.entries_for(record.id);
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.status == QueueStatus::Completed));
        assert_eq!(collaborator.calls(), 2);
    }

    #[test]
    fn failing_import_backs_off_then_recovers() {
        let store = InMemoryJobStore::new();
        let settings = Settings::default();
        let record = JobRecord::recurring(JobFamily::Import, TEN_MINUTES, t0()).unwrap();
        store.session().insert_record(&record).unwrap();

        let collaborator = Arc::new(ScriptedCollaborator::new(vec![
            Err(CollaboratorError::Unavailable("mailbox unreachable".into())),
            Err(CollaboratorError::Unavailable("mailbox unreachable".into())),
            Ok(ExecutionReport::imported(1, 1)),
        ]));
        let mut detector = JobDetector::new(JobFamily::Import, &settings);
        let mut worker = ImportWorker::new(collaborator, &settings);
        let id = WorkerId::new();
        let mut session = store.session();

        let mut run_at = |at| {
            detector.process_cycle(&mut session, id, at).unwrap();
            worker.process_cycle(&mut session, id, at).unwrap();
        };

        run_at(t0());
        let first = store.record(record.id).unwrap();
        assert_eq!(first.status, JobStatus::Failed);
        assert_eq!(first.next_run_at, Some(t0() + minutes(20)));

        let retry_at = t0() + minutes(20);
        run_at(retry_at);
        let second = store.record(record.id).unwrap();
        assert_eq!(second.consecutive_errors, 2);
        assert_eq!(second.next_run_at, Some(retry_at + minutes(40)));

        let recover_at = retry_at + minutes(40);
        run_at(recover_at);
        let recovered = store.record(record.id).unwrap();
        assert_eq!(recovered.status, JobStatus::Pending);
        assert_eq!(recovered.consecutive_errors, 0);
        assert_eq!(recovered.error_message, None);
        assert_eq!(recovered.next_run_at, Some(recover_at + minutes(10)));
    }

    #[test]
    fn parsing_jobs_flow_to_their_outcome_classes() {
        let store = InMemoryJobStore::new();
        let settings = Settings::default();
        let mut records = Vec::new();
        for message_id in ["m-1", "m-2", "m-3"] {
            let record = JobRecord::new(JobFamily::Parsing, JobStatus::Pending, t0())
                .with_payload(json!({ "message_id": message_id }));
            store.session().insert_record(&record).unwrap();
            records.push(record);
        }

        let collaborator = |job: &JobRecord| -> Result<ExecutionReport, CollaboratorError> {
            match job.payload["message_id"].as_str() {
                Some("m-1") => Ok(ExecutionReport::succeeded(ExecutionResult {
                    transaction_id: Some("txn-1".into()),
                    ..ExecutionResult::default()
                })),
                Some("m-2") => Ok(ExecutionReport::nothing_extracted(
                    ParseSummary::NoTemplatesConfigured,
                    "bank has no templates",
                )),
                _ => Err(CollaboratorError::Failed("malformed MIME".into())),
            }
        };
        let collaborator: Arc<dyn DomainCollaborator> = Arc::new(collaborator);

        let mut detector = JobDetector::new(JobFamily::Parsing, &settings);
        let mut worker = ParsingWorker::new(collaborator, &settings);
        let id = WorkerId::new();
        let mut session = store.session();

        detector.process_cycle(&mut session, id, t0()).unwrap();
        for _ in 0..4 {
            worker.process_cycle(&mut session, id, t0()).unwrap();
        }

        let summary = |i: usize| store.record(records[i].id).unwrap().summary;
        assert_eq!(summary(0), Some(ParseSummary::TransactionCreated));
        assert_eq!(summary(1), Some(ParseSummary::NoTemplatesConfigured));
        assert_eq!(summary(2), Some(ParseSummary::ProcessingError));
        assert_eq!(store.record(records[2].id).unwrap().status, JobStatus::Error);

        // Errored parsing jobs are not picked up again.
        detector.process_cycle(&mut session, id, t0()).unwrap();
        assert_eq!(store.entries().len(), 3);
    }

    #[test]
    fn concurrent_workers_process_each_entry_once() {
        let store = InMemoryJobStore::new();
        let settings = Settings::default();
        for _ in 0..40 {
            store
                .session()
                .insert_record(&JobRecord::new(JobFamily::Parsing, JobStatus::Pending, t0()))
                .unwrap();
        }
        JobDetector::new(JobFamily::Parsing, &settings)
            .process_cycle(&mut store.session(), WorkerId::new(), t0())
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                let settings = settings.clone();
                let seen = Arc::clone(&seen);
                thread::spawn(move || {
                    let collaborator = move |job: &JobRecord| -> Result<ExecutionReport, CollaboratorError> {
                        seen.lock().unwrap().push(job.id);
                        Ok(ExecutionReport::succeeded(ExecutionResult::default()))
                    };
                    let mut worker = ParsingWorker::new(Arc::new(collaborator), &settings);
                    let mut session = store.session();
                    for _ in 0..40 {
                        worker.process_cycle(&mut session, WorkerId::new(), Utc::now()).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let seen = seen.lock().unwrap();
        let unique: HashSet<_> = seen.iter().collect();
        assert_eq!(seen.len(), 40);
        assert_eq!(unique.len(), 40);
        assert!(store.entries().iter().all(|e| e.status == QueueStatus::Completed));
    }

    #[test]
    fn manager_drives_the_roster_end_to_end() {
        let store = InMemoryJobStore::new();
        let settings = Settings::default();
        let record = JobRecord::recurring(JobFamily::Import, TEN_MINUTES, Utc::now()).unwrap();
        store.session().insert_record(&record).unwrap();

        let collaborator = Arc::new(ScriptedCollaborator::always(Ok(ExecutionReport::imported(2, 2))));
        let fast = RuntimeSettings::new(Duration::from_millis(5));
        let detector_settings = settings.clone();
        let worker_settings = settings.clone();
        let specs = vec![
            WorkerSpec::new("email_import_detector", fast.clone(), move || {
                Box::new(JobDetector::new(JobFamily::Import, &detector_settings)) as Box<dyn Worker>
            }),
            WorkerSpec::new("email_import_worker", fast, {
                let collaborator = collaborator.clone();
                move || {
                    Box::new(ImportWorker::new(collaborator.clone(), &worker_settings))
                        as Box<dyn Worker>
                }
            }),
        ];
        let manager =
            WorkerManager::new(Arc::new(store.clone()), ManagerSettings::default(), specs);

        manager.start_all();
        assert!(wait_until(Duration::from_secs(3), || {
            store.record(record.id).is_some_and(|r| r.total_runs == 1)
        }));
        manager.stop_all();

        let stored = store.record(record.id).unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.worker_id, None);
        assert_eq!(collaborator.calls(), 1);
        let counters = store.counters();
        assert!(counters.closes >= 2);
    }
}
