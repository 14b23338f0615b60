//! Generic worker runtime.
//!
//! A [`WorkerRunner`] drives one [`Worker`] on a dedicated thread:
//! heartbeat, one cycle against the worker's private session, error
//! accounting, then an interruptible sleep. Stopping a worker (requested or
//! after too many consecutive errors) runs its cleanup hook on a fresh session.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use mailledger_core::WorkerId;

use super::WorkerError;
use crate::jobs::{JobStore, SessionFactory};

/// One kind of background work, run cycle by cycle.
pub trait Worker: Send {
    fn name(&self) -> &str;

    /// Perform one unit of work. Commit what should be kept; anything left
    /// uncommitted is rolled back when the cycle ends.
    fn process_cycle(
        &mut self,
        session: &mut dyn JobStore,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<(), WorkerError>;

    /// Release jobs left in flight by the instance `owner`.
    ///
    /// Called for the worker's own identity when it stops, and for its
    /// predecessor's identity when it replaces a dead instance.
    fn reset_owned_jobs(
        &mut self,
        session: &mut dyn JobStore,
        owner: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<(), WorkerError> {
        let _ = (session, owner, now);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Created,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub sleep_interval: Duration,
    pub max_consecutive_errors: u32,
    pub health_timeout: Duration,
}

impl RuntimeSettings {
    pub fn new(sleep_interval: Duration) -> Self {
        Self {
            sleep_interval,
            max_consecutive_errors: 10,
            health_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_max_consecutive_errors(mut self, max: u32) -> Self {
        self.max_consecutive_errors = max.max(1);
        self
    }

    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }
}

/// Point-in-time view of one worker, as reported by the manager.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerStatus {
    pub name: String,
    pub id: WorkerId,
    pub lifecycle: Lifecycle,
    pub alive: bool,
    pub healthy: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub sleep_interval_secs: f64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State written by the worker thread and read by its handle.
#[derive(Debug)]
struct SharedState {
    lifecycle: Mutex<Lifecycle>,
    heartbeat: Mutex<Option<DateTime<Utc>>>,
    consecutive_errors: AtomicU32,
    stop_requested: AtomicBool,
}

impl SharedState {
    fn new() -> Self {
        Self {
            lifecycle: Mutex::new(Lifecycle::Created),
            heartbeat: Mutex::new(None),
            consecutive_errors: AtomicU32::new(0),
            stop_requested: AtomicBool::new(false),
        }
    }

    fn set_lifecycle(&self, next: Lifecycle) {
        *lock(&self.lifecycle) = next;
    }

    fn beat(&self, now: DateTime<Utc>) {
        *lock(&self.heartbeat) = Some(now);
    }

    fn record_error(&self) -> u32 {
        self.consecutive_errors.fetch_add(1, Ordering::SeqCst).saturating_add(1)
    }

    fn reset_errors(&self) {
        self.consecutive_errors.store(0, Ordering::SeqCst);
    }
}

/// Handle to control, observe and join a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    id: WorkerId,
    settings: RuntimeSettings,
    shared: Arc<SharedState>,
    stop: mpsc::Sender<()>,
    done: mpsc::Receiver<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *lock(&self.shared.lifecycle)
    }

    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        *lock(&self.shared.heartbeat)
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.shared.consecutive_errors.load(Ordering::SeqCst)
    }

    /// Whether the worker thread is still executing.
    pub fn is_alive(&self) -> bool {
        self.join.as_ref().is_some_and(|join| !join.is_finished())
    }

    /// Whether the last heartbeat is more recent than the health timeout.
    /// A worker that never beat is unhealthy.
    pub fn is_healthy(&self, now: DateTime<Utc>) -> bool {
        self.last_heartbeat().is_some_and(|beat| {
            chrono::Duration::from_std(self.settings.health_timeout)
                .map_or(true, |timeout| now.signed_duration_since(beat) < timeout)
        })
    }

    /// Ask the worker to stop. It finishes its current cycle, skips the
    /// rest of its sleep, and runs cleanup.
    pub fn stop(&self) {
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        {
            let mut lifecycle = lock(&self.shared.lifecycle);
            if matches!(*lifecycle, Lifecycle::Created | Lifecycle::Running) {
                *lifecycle = Lifecycle::Stopping;
            }
        }
        let _ = self.stop.send(());
    }

    /// Wait at most `timeout` for the worker thread to finish.
    ///
    /// Returns `false` if it is still running; the handle can be joined again.
    pub fn join_timeout(&mut self, timeout: Duration) -> bool {
        let Some(join) = self.join.take() else {
            return true;
        };
        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if join.join().is_err() {
                    warn!(worker = %self.name, worker_id = %self.id, "worker thread panicked");
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                self.join = Some(join);
                false
            }
        }
    }

    pub fn status(&self, now: DateTime<Utc>) -> WorkerStatus {
        WorkerStatus {
            name: self.name.clone(),
            id: self.id,
            lifecycle: self.lifecycle(),
            alive: self.is_alive(),
            healthy: self.is_healthy(now),
            last_heartbeat: self.last_heartbeat(),
            error_count: self.consecutive_errors(),
            sleep_interval_secs: self.settings.sleep_interval.as_secs_f64(),
        }
    }
}

/// Spawns workers onto their own threads.
#[derive(Debug)]
pub struct WorkerRunner;

impl WorkerRunner {
    /// Start `worker` under a fresh identity.
    ///
    /// `predecessor` is the identity of the instance this one replaces; its
    /// in-flight jobs are released before the first cycle.
    pub fn spawn(
        worker: Box<dyn Worker>,
        sessions: Arc<dyn SessionFactory>,
        settings: RuntimeSettings,
        predecessor: Option<WorkerId>,
    ) -> io::Result<WorkerHandle> {
        let name = worker.name().to_string();
        let id = WorkerId::new();
        let shared = Arc::new(SharedState::new());
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel::<()>();

        let ctx = LoopContext {
            name: name.clone(),
            id,
            settings: settings.clone(),
            shared: Arc::clone(&shared),
            sessions,
            predecessor,
        };

        let join = thread::Builder::new().name(name.clone()).spawn(move || {
            run_loop(worker, &ctx, &stop_rx);
            let _ = done_tx.send(());
        })?;

        Ok(WorkerHandle {
            name,
            id,
            settings,
            shared,
            stop: stop_tx,
            done: done_rx,
            join: Some(join),
        })
    }
}

struct LoopContext {
    name: String,
    id: WorkerId,
    settings: RuntimeSettings,
    shared: Arc<SharedState>,
    sessions: Arc<dyn SessionFactory>,
    predecessor: Option<WorkerId>,
}

impl LoopContext {
    fn open_session(&self) -> Option<Box<dyn JobStore>> {
        match self.sessions.open() {
            Ok(session) => Some(session),
            Err(err) => {
                warn!(worker = %self.name, worker_id = %self.id, error = %err, "failed to open store session");
                None
            }
        }
    }
}

fn run_loop(mut worker: Box<dyn Worker>, ctx: &LoopContext, stop_rx: &mpsc::Receiver<()>) {
    {
        let mut lifecycle = lock(&ctx.shared.lifecycle);
        if *lifecycle == Lifecycle::Created {
            *lifecycle = Lifecycle::Running;
        }
    }
    info!(
        worker = %ctx.name,
        worker_id = %ctx.id,
        sleep_interval_ms = ctx.settings.sleep_interval.as_millis() as u64,
        "worker started"
    );

    let mut session = ctx.open_session();
    let mut predecessor = ctx.predecessor;

    loop {
        // Retried until a session is available and the release commits.
        if let (Some(previous), Some(store)) = (predecessor, session.as_mut()) {
            if recover_predecessor(worker.as_mut(), store.as_mut(), ctx, previous) {
                predecessor = None;
            }
        }

        if ctx.shared.stop_requested.load(Ordering::SeqCst) {
            break;
        }

        ctx.shared.beat(Utc::now());

        let result = match session.as_mut() {
            Some(store) => worker.process_cycle(store.as_mut(), ctx.id, Utc::now()),
            None => Err(WorkerError::SessionUnavailable(
                "no store session could be opened".to_string(),
            )),
        };

        match result {
            Ok(()) => {
                ctx.shared.reset_errors();
                if let Some(store) = session.as_mut() {
                    if let Err(err) = store.rollback() {
                        debug!(worker = %ctx.name, error = %err, "failed to end idle transaction");
                    }
                }
            }
            Err(err) => {
                let errors = ctx.shared.record_error();
                error!(
                    worker = %ctx.name,
                    worker_id = %ctx.id,
                    error = %err,
                    consecutive_errors = errors,
                    "worker cycle failed"
                );

                if err.needs_refresh() {
                    if let Some(mut stale) = session.take() {
                        let _ = stale.rollback();
                        let _ = stale.close();
                    }
                    session = ctx.open_session();
                } else if let Some(store) = session.as_mut() {
                    if let Err(rollback_err) = store.rollback() {
                        debug!(worker = %ctx.name, error = %rollback_err, "rollback after failed cycle failed");
                    }
                }

                if errors >= ctx.settings.max_consecutive_errors {
                    error!(
                        worker = %ctx.name,
                        worker_id = %ctx.id,
                        max_consecutive_errors = ctx.settings.max_consecutive_errors,
                        "too many consecutive errors; stopping worker"
                    );
                    break;
                }
            }
        }

        match stop_rx.recv_timeout(ctx.settings.sleep_interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    ctx.shared.set_lifecycle(Lifecycle::Stopping);
    cleanup(worker.as_mut(), session, ctx);
    ctx.shared.set_lifecycle(Lifecycle::Stopped);
    info!(worker = %ctx.name, worker_id = %ctx.id, "worker stopped");
}

fn recover_predecessor(
    worker: &mut dyn Worker,
    session: &mut dyn JobStore,
    ctx: &LoopContext,
    predecessor: WorkerId,
) -> bool {
    let outcome = worker
        .reset_owned_jobs(session, predecessor, Utc::now())
        .and_then(|()| session.commit().map_err(WorkerError::from));
    match outcome {
        Ok(()) => {
            info!(
                worker = %ctx.name,
                worker_id = %ctx.id,
                predecessor = %predecessor,
                "released jobs of previous instance"
            );
            true
        }
        Err(err) => {
            warn!(
                worker = %ctx.name,
                worker_id = %ctx.id,
                predecessor = %predecessor,
                error = %err,
                "failed to release jobs of previous instance"
            );
            let _ = session.rollback();
            false
        }
    }
}

/// Close the loop's session and reset this instance's jobs on a fresh one,
/// so a poisoned session cannot block cleanup.
fn cleanup(worker: &mut dyn Worker, session: Option<Box<dyn JobStore>>, ctx: &LoopContext) {
    if let Some(mut store) = session {
        let _ = store.rollback();
        if let Err(err) = store.close() {
            debug!(worker = %ctx.name, error = %err, "failed to close store session");
        }
    }

    let Some(mut fresh) = ctx.open_session() else {
        warn!(worker = %ctx.name, worker_id = %ctx.id, "skipping cleanup: no store session");
        return;
    };

    let outcome = worker
        .reset_owned_jobs(fresh.as_mut(), ctx.id, Utc::now())
        .and_then(|()| fresh.commit().map_err(WorkerError::from));
    if let Err(err) = outcome {
        warn!(worker = %ctx.name, worker_id = %ctx.id, error = %err, "worker cleanup failed");
        let _ = fresh.rollback();
    }
    if let Err(err) = fresh.close() {
        debug!(worker = %ctx.name, error = %err, "failed to close cleanup session");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{InMemoryJobStore, StoreError};
    use crate::workers::test_support::wait_until;
    use std::sync::atomic::AtomicUsize;

    /// Fails its first `failures` cycles with `error`, then succeeds.
    struct ScriptedWorker {
        cycles: Arc<AtomicUsize>,
        failures: usize,
        error: fn() -> StoreError,
        resets: Arc<Mutex<Vec<WorkerId>>>,
    }

    impl ScriptedWorker {
        fn new(failures: usize, error: fn() -> StoreError) -> Self {
            Self {
                cycles: Arc::new(AtomicUsize::new(0)),
                failures,
                error,
                resets: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl Worker for ScriptedWorker {
        fn name(&self) -> &str {
            "scripted"
        }

        fn process_cycle(
            &mut self,
            _session: &mut dyn JobStore,
            _worker: WorkerId,
            _now: DateTime<Utc>,
        ) -> Result<(), WorkerError> {
            let cycle = self.cycles.fetch_add(1, Ordering::SeqCst);
            if cycle < self.failures {
                return Err((self.error)().into());
            }
            Ok(())
        }

        fn reset_owned_jobs(
            &mut self,
            _session: &mut dyn JobStore,
            owner: WorkerId,
            _now: DateTime<Utc>,
        ) -> Result<(), WorkerError> {
            lock(&self.resets).push(owner);
            Ok(())
        }
    }

    fn storage_error() -> StoreError {
        StoreError::Storage("disk full".into())
    }

    fn conflict() -> StoreError {
        StoreError::SessionConflict("deadlock detected".into())
    }

    fn fast() -> RuntimeSettings {
        RuntimeSettings::new(Duration::from_millis(5))
    }

    #[test]
    fn runs_cycles_until_stopped_and_cleans_up_its_own_jobs() {
        let store = InMemoryJobStore::new();
        let worker = ScriptedWorker::new(0, storage_error);
        let cycles = Arc::clone(&worker.cycles);
        let resets = Arc::clone(&worker.resets);

        let mut handle =
            WorkerRunner::spawn(Box::new(worker), Arc::new(store.clone()), fast(), None).unwrap();

        assert!(wait_until(Duration::from_secs(2), || cycles.load(Ordering::SeqCst) >= 3));
        assert!(handle.is_alive());
        assert!(handle.is_healthy(Utc::now()));
        assert_eq!(handle.lifecycle(), Lifecycle::Running);

        handle.stop();
        assert!(handle.join_timeout(Duration::from_secs(2)));
        assert!(!handle.is_alive());
        assert_eq!(handle.lifecycle(), Lifecycle::Stopped);
        assert_eq!(*lock(&resets), vec![handle.id()]);
    }

    #[test]
    fn stop_interrupts_a_long_sleep() {
        let store = InMemoryJobStore::new();
        let worker = ScriptedWorker::new(0, storage_error);
        let cycles = Arc::clone(&worker.cycles);
        let settings = RuntimeSettings::new(Duration::from_secs(3600));

        let mut handle =
            WorkerRunner::spawn(Box::new(worker), Arc::new(store), settings, None).unwrap();
        assert!(wait_until(Duration::from_secs(2), || cycles.load(Ordering::SeqCst) == 1));

        handle.stop();
        assert!(handle.join_timeout(Duration::from_secs(2)));
        assert_eq!(cycles.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stops_itself_after_too_many_consecutive_errors() {
        let store = InMemoryJobStore::new();
        let worker = ScriptedWorker::new(usize::MAX, storage_error);
        let cycles = Arc::clone(&worker.cycles);
        let resets = Arc::clone(&worker.resets);
        let settings = fast().with_max_consecutive_errors(3);

        let mut handle =
            WorkerRunner::spawn(Box::new(worker), Arc::new(store), settings, None).unwrap();

        assert!(handle.join_timeout(Duration::from_secs(2)));
        assert_eq!(cycles.load(Ordering::SeqCst), 3);
        assert_eq!(handle.consecutive_errors(), 3);
        assert_eq!(handle.lifecycle(), Lifecycle::Stopped);
        assert_eq!(lock(&resets).len(), 1);
    }

    #[test]
    fn a_successful_cycle_resets_the_error_count() {
        let store = InMemoryJobStore::new();
        let worker = ScriptedWorker::new(2, storage_error);
        let cycles = Arc::clone(&worker.cycles);
        let settings = fast().with_max_consecutive_errors(3);

        let mut handle =
            WorkerRunner::spawn(Box::new(worker), Arc::new(store), settings, None).unwrap();

        assert!(wait_until(Duration::from_secs(2), || cycles.load(Ordering::SeqCst) >= 4));
        assert_eq!(handle.consecutive_errors(), 0);
        assert!(handle.is_alive());

        handle.stop();
        assert!(handle.join_timeout(Duration::from_secs(2)));
    }

    #[test]
    fn session_conflicts_replace_the_session() {
        let store = InMemoryJobStore::new();
        let worker = ScriptedWorker::new(1, conflict);
        let cycles = Arc::clone(&worker.cycles);

        let mut handle =
            WorkerRunner::spawn(Box::new(worker), Arc::new(store.clone()), fast(), None).unwrap();
        assert!(wait_until(Duration::from_secs(2), || cycles.load(Ordering::SeqCst) >= 2));
        // Initial session plus its replacement.
        assert!(store.counters().opened >= 2);

        handle.stop();
        assert!(handle.join_timeout(Duration::from_secs(2)));
        assert_eq!(handle.consecutive_errors(), 0);
    }

    #[test]
    fn replacement_releases_its_predecessors_jobs_first() {
        let store = InMemoryJobStore::new();
        let worker = ScriptedWorker::new(0, storage_error);
        let resets = Arc::clone(&worker.resets);
        let predecessor = WorkerId::new();

        let mut handle = WorkerRunner::spawn(
            Box::new(worker),
            Arc::new(store),
            fast(),
            Some(predecessor),
        )
        .unwrap();
        handle.stop();
        assert!(handle.join_timeout(Duration::from_secs(2)));

        assert_eq!(*lock(&resets), vec![predecessor, handle.id()]);
    }

    /// Refuses its first `failures` opens, as a database that is restarting.
    struct UnreachableAtFirst {
        store: InMemoryJobStore,
        failures: AtomicUsize,
    }

    impl SessionFactory for UnreachableAtFirst {
        fn open(&self) -> Result<Box<dyn JobStore>, StoreError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::Connection("db restarting".into()));
            }
            self.store.open()
        }
    }

    #[test]
    fn predecessor_is_released_once_a_session_opens() {
        let worker = ScriptedWorker::new(0, storage_error);
        let resets = Arc::clone(&worker.resets);
        let cycles = Arc::clone(&worker.cycles);
        let predecessor = WorkerId::new();
        let sessions = Arc::new(UnreachableAtFirst {
            store: InMemoryJobStore::new(),
            failures: AtomicUsize::new(1),
        });

        let mut handle =
            WorkerRunner::spawn(Box::new(worker), sessions, fast(), Some(predecessor)).unwrap();

        assert!(wait_until(Duration::from_secs(2), || cycles.load(Ordering::SeqCst) >= 3));
        assert_eq!(*lock(&resets), vec![predecessor]);
        assert!(handle.is_alive());

        handle.stop();
        assert!(handle.join_timeout(Duration::from_secs(2)));
        assert_eq!(*lock(&resets), vec![predecessor, handle.id()]);
    }

    #[test]
    fn status_uses_id_and_error_count_keys() {
        let store = InMemoryJobStore::new();
        let worker = ScriptedWorker::new(0, storage_error);
        let mut handle =
            WorkerRunner::spawn(Box::new(worker), Arc::new(store), fast(), None).unwrap();

        let json = serde_json::to_value(handle.status(Utc::now())).unwrap();
        assert_eq!(json["id"], serde_json::to_value(handle.id()).unwrap());
        assert_eq!(json["error_count"], 0);
        assert!(json.get("worker_id").is_none());
        assert!(json.get("consecutive_errors").is_none());

        handle.stop();
        assert!(handle.join_timeout(Duration::from_secs(2)));
    }

    #[test]
    fn health_follows_the_heartbeat() {
        let store = InMemoryJobStore::new();
        let worker = ScriptedWorker::new(0, storage_error);
        let settings = RuntimeSettings::new(Duration::from_secs(3600))
            .with_health_timeout(Duration::from_secs(60));

        let mut handle =
            WorkerRunner::spawn(Box::new(worker), Arc::new(store), settings, None).unwrap();
        assert!(wait_until(Duration::from_secs(2), || handle.last_heartbeat().is_some()));

        let beat = handle.last_heartbeat().unwrap();
        assert!(handle.is_healthy(beat + chrono::Duration::seconds(59)));
        assert!(!handle.is_healthy(beat + chrono::Duration::seconds(61)));

        let status = handle.status(beat);
        assert_eq!(status.name, "scripted");
        assert_eq!(status.sleep_interval_secs, 3600.0);

        handle.stop();
        assert!(handle.join_timeout(Duration::from_secs(2)));
    }
}
