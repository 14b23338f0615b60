//! Postgres job store against a live database.
//!
//! Skipped unless `DATABASE_URL` points at a disposable database.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use chrono::{DurationRound, Utc};
use serde_json::json;

use mailledger_core::WorkerId;
use mailledger_infra::jobs::{
    EnqueueOutcome, JobFamily, JobRecord, JobStatus, PostgresSessionFactory, QueueEntry,
    QueueStatus, SessionFactory,
};

fn factory() -> Option<PostgresSessionFactory> {
    let url = std::env::var("DATABASE_URL").ok().filter(|u| !u.is_empty())?;
    let factory = PostgresSessionFactory::new(url).with_connect_timeout(Duration::from_secs(5));
    factory.apply_schema().unwrap();
    Some(factory)
}

#[test]
fn postgres_store_enqueues_claims_and_round_trips() {
    let Some(factory) = factory() else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    // Postgres keeps microseconds.
    let now = Utc::now()
        .duration_trunc(chrono::Duration::microseconds(1))
        .unwrap();
    let lease = Duration::from_secs(1800);

    // Round trip.
    let record = JobRecord::recurring(JobFamily::Import, Duration::from_secs(600), now)
        .unwrap()
        .with_payload(json!({ "integration_id": "it-pg" }));
    let mut session = factory.open().unwrap();
    session.insert_record(&record).unwrap();
    session.commit().unwrap();
    assert_eq!(session.get_record(record.id).unwrap(), Some(record.clone()));

    // Enqueue is single-shot per record.
    let entry = QueueEntry::for_record(&record, i32::MAX, now);
    assert_eq!(session.enqueue(&record, &entry, now).unwrap(), EnqueueOutcome::Enqueued);
    session.commit().unwrap();
    let again = QueueEntry::for_record(&record, i32::MAX, now);
    assert_ne!(session.enqueue(&record, &again, now).unwrap(), EnqueueOutcome::Enqueued);
    session.commit().unwrap();
    assert_eq!(session.get_record(record.id).unwrap().unwrap().status, JobStatus::Queued);

    // Exactly one of several concurrent sessions claims the entry.
    let factory = Arc::new(factory);
    let barrier = Arc::new(Barrier::new(6));
    let handles: Vec<_> = (0..6)
        .map(|_| {
            let factory = Arc::clone(&factory);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut session = factory.open().unwrap();
                barrier.wait();
                let claimed = session
                    .claim_next(JobFamily::Import.queue_name(), WorkerId::new(), Utc::now(), lease)
                    .unwrap();
                session.commit().unwrap();
                claimed.map(|e| e.id)
            })
        })
        .collect();
    let claims: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(claims.iter().filter(|id| **id == Some(entry.id)).count(), 1);

    let claimed = session.get_entry(entry.id).unwrap().unwrap();
    assert_eq!(claimed.status, QueueStatus::Running);
    assert_eq!(claimed.attempts, 1);
    assert!(claimed.worker_id.is_some());

    let stats = session.queue_stats(JobFamily::Import.queue_name()).unwrap();
    assert!(stats.running >= 1);
    session.close().unwrap();
}
