//! Worker manager: starts the worker roster, restarts dead or stalled
//! workers, reports status and stops everything on shutdown.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use mailledger_core::WorkerId;

use super::runtime::{RuntimeSettings, Worker, WorkerHandle, WorkerRunner, WorkerStatus};
use crate::config::Settings;
use crate::jobs::SessionFactory;

type WorkerFactory = Arc<dyn Fn() -> Box<dyn Worker> + Send + Sync>;

/// How to (re)create one worker of the roster.
#[derive(Clone)]
pub struct WorkerSpec {
    name: String,
    runtime: RuntimeSettings,
    factory: WorkerFactory,
}

impl WorkerSpec {
    pub fn new(
        name: impl Into<String>,
        runtime: RuntimeSettings,
        factory: impl Fn() -> Box<dyn Worker> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            runtime,
            factory: Arc::new(factory),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sleep_interval(&self) -> Duration {
        self.runtime.sleep_interval
    }
}

impl std::fmt::Debug for WorkerSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSpec")
            .field("name", &self.name)
            .field("runtime", &self.runtime)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerSettings {
    pub monitor_interval: Duration,
    pub restart_join_timeout: Duration,
    pub stop_timeout: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_secs(30),
            restart_join_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&Settings> for ManagerSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            monitor_interval: settings.monitor_interval,
            restart_join_timeout: settings.restart_join_timeout,
            stop_timeout: settings.stop_timeout,
        }
    }
}

/// Snapshot of the whole worker system.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStatus {
    pub manager_running: bool,
    pub total_workers: usize,
    pub alive_workers: usize,
    pub healthy_workers: usize,
    pub workers: Vec<WorkerStatus>,
    pub timestamp: DateTime<Utc>,
}

/// Result of one health check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorReport {
    pub total: usize,
    pub alive: usize,
    pub healthy: usize,
    pub restarted: usize,
}

struct Slot {
    spec: WorkerSpec,
    handle: Option<WorkerHandle>,
}

struct MonitorThread {
    stop: mpsc::Sender<()>,
    join: thread::JoinHandle<()>,
}

struct ManagerInner {
    sessions: Arc<dyn SessionFactory>,
    settings: ManagerSettings,
    specs: Vec<WorkerSpec>,
    slots: Mutex<Vec<Slot>>,
    running: AtomicBool,
    monitor: Mutex<Option<MonitorThread>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the worker roster. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct WorkerManager {
    inner: Arc<ManagerInner>,
}

impl WorkerManager {
    pub fn new(
        sessions: Arc<dyn SessionFactory>,
        settings: ManagerSettings,
        specs: Vec<WorkerSpec>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                sessions,
                settings,
                specs,
                slots: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                monitor: Mutex::new(None),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn spawn(&self, spec: &WorkerSpec, predecessor: Option<WorkerId>) -> Option<WorkerHandle> {
        let worker = (spec.factory)();
        match WorkerRunner::spawn(
            worker,
            Arc::clone(&self.inner.sessions),
            spec.runtime.clone(),
            predecessor,
        ) {
            Ok(handle) => Some(handle),
            Err(err) => {
                error!(worker = %spec.name, error = %err, "failed to spawn worker");
                None
            }
        }
    }

    /// Start every worker of the roster. A no-op when already running.
    pub fn start_all(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!("worker manager already running");
            return;
        }

        let mut slots = lock(&self.inner.slots);
        slots.clear();
        for spec in &self.inner.specs {
            let handle = self.spawn(spec, None);
            if let Some(handle) = &handle {
                info!(worker = %spec.name, worker_id = %handle.id(), "worker spawned");
            }
            slots.push(Slot {
                spec: spec.clone(),
                handle,
            });
        }
        let started = slots.iter().filter(|slot| slot.handle.is_some()).count();
        info!(started, total = slots.len(), "worker manager started");
    }

    /// Replace every worker that has died or stopped heartbeating.
    ///
    /// Stale handles are stopped and joined without holding the roster lock.
    pub fn monitor_tick(&self) -> MonitorReport {
        let now = Utc::now();
        let mut report = MonitorReport::default();
        let mut stale = Vec::new();

        {
            let mut slots = lock(&self.inner.slots);
            for (index, slot) in slots.iter_mut().enumerate() {
                report.total += 1;
                let (alive, healthy) = slot
                    .handle
                    .as_ref()
                    .map_or((false, false), |h| (h.is_alive(), h.is_healthy(now)));
                if alive {
                    report.alive += 1;
                }
                if alive && healthy {
                    report.healthy += 1;
                    continue;
                }
                if !self.is_running() {
                    continue;
                }

                warn!(worker = %slot.spec.name, alive, healthy, "restarting worker");
                stale.push((index, slot.spec.clone(), slot.handle.take()));
            }
        }

        for (index, spec, handle) in stale {
            let predecessor = handle.as_ref().map(WorkerHandle::id);
            if let Some(mut handle) = handle {
                handle.stop();
                if !handle.join_timeout(self.inner.settings.restart_join_timeout) {
                    warn!(worker = %spec.name, worker_id = %handle.id(), "worker did not stop in time; abandoning its thread");
                }
            }

            let mut slots = lock(&self.inner.slots);
            let Some(slot) = slots.get_mut(index) else {
                continue;
            };
            if !self.is_running() || slot.handle.is_some() {
                continue;
            }
            slot.handle = self.spawn(&spec, predecessor);
            if slot.handle.is_some() {
                report.restarted += 1;
            }
        }

        info!(
            total = report.total,
            alive = report.alive,
            healthy = report.healthy,
            restarted = report.restarted,
            "worker health check"
        );
        report
    }

    /// Run `monitor_tick` every monitor interval on a background thread
    /// until [`WorkerManager::stop_all`].
    pub fn spawn_monitor(&self) -> io::Result<()> {
        let mut monitor = lock(&self.inner.monitor);
        if monitor.is_some() {
            return Ok(());
        }

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let manager = self.clone();
        let interval = self.inner.settings.monitor_interval;
        let join = thread::Builder::new()
            .name("worker_monitor".to_string())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    if !manager.is_running() {
                        break;
                    }
                    manager.monitor_tick();
                }
            })?;

        *monitor = Some(MonitorThread {
            stop: stop_tx,
            join,
        });
        Ok(())
    }

    /// Stop the monitor and every worker, waiting a bounded time for each.
    pub fn stop_all(&self) {
        self.inner.running.store(false, Ordering::SeqCst);

        if let Some(monitor) = lock(&self.inner.monitor).take() {
            let _ = monitor.stop.send(());
            if monitor.join.join().is_err() {
                warn!("worker monitor panicked");
            }
        }

        let mut slots = lock(&self.inner.slots);
        for handle in slots.iter().filter_map(|slot| slot.handle.as_ref()) {
            handle.stop();
        }

        let mut stragglers = 0usize;
        for slot in slots.iter_mut() {
            if let Some(handle) = slot.handle.as_mut() {
                if !handle.join_timeout(self.inner.settings.stop_timeout) {
                    stragglers += 1;
                    warn!(worker = %slot.spec.name, worker_id = %handle.id(), "worker did not stop in time");
                }
            }
        }
        slots.clear();

        info!(stragglers, "worker manager stopped");
    }

    pub fn status(&self) -> SystemStatus {
        let now = Utc::now();
        let slots = lock(&self.inner.slots);
        let workers: Vec<WorkerStatus> = slots
            .iter()
            .filter_map(|slot| slot.handle.as_ref())
            .map(|handle| handle.status(now))
            .collect();

        SystemStatus {
            manager_running: self.is_running(),
            total_workers: slots.len(),
            alive_workers: workers.iter().filter(|w| w.alive).count(),
            healthy_workers: workers.iter().filter(|w| w.alive && w.healthy).count(),
            workers,
            timestamp: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{InMemoryJobStore, JobStore};
    use crate::workers::WorkerError;
    use crate::workers::test_support::wait_until;
    use std::sync::atomic::AtomicUsize;

    /// Runs `healthy_cycles` cycles, then fails forever.
    struct Flaky {
        healthy_cycles: usize,
        cycles: usize,
        resets: Arc<Mutex<Vec<WorkerId>>>,
    }

    impl Worker for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn process_cycle(
            &mut self,
            _session: &mut dyn JobStore,
            _worker: WorkerId,
            _now: DateTime<Utc>,
        ) -> Result<(), WorkerError> {
            self.cycles += 1;
            if self.cycles > self.healthy_cycles {
                return Err(WorkerError::SessionUnavailable("database gone".into()));
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

    fn flaky_spec(
        healthy_cycles: usize,
        max_errors: u32,
        builds: Arc<AtomicUsize>,
        resets: Arc<Mutex<Vec<WorkerId>>>,
    ) -> WorkerSpec {
        let runtime =
            RuntimeSettings::new(Duration::from_millis(5)).with_max_consecutive_errors(max_errors);
        WorkerSpec::new("flaky", runtime, move || {
            builds.fetch_add(1, Ordering::SeqCst);
            Box::new(Flaky {
                healthy_cycles,
                cycles: 0,
                resets: Arc::clone(&resets),
            }) as Box<dyn Worker>
        })
    }

    /// First instance fails every cycle; its replacements never fail.
    fn dies_once_spec(builds: Arc<AtomicUsize>, resets: Arc<Mutex<Vec<WorkerId>>>) -> WorkerSpec {
        let runtime = RuntimeSettings::new(Duration::from_millis(5)).with_max_consecutive_errors(2);
        WorkerSpec::new("flaky", runtime, move || {
            let previous = builds.fetch_add(1, Ordering::SeqCst);
            Box::new(Flaky {
                healthy_cycles: if previous == 0 { 0 } else { usize::MAX },
                cycles: 0,
                resets: Arc::clone(&resets),
            }) as Box<dyn Worker>
        })
    }

    /// Blocks inside every cycle, so its heartbeat goes stale.
    struct Stuck;

    impl Worker for Stuck {
        fn name(&self) -> &str {
            "stuck"
        }

        fn process_cycle(
            &mut self,
            _session: &mut dyn JobStore,
            _worker: WorkerId,
            _now: DateTime<Utc>,
        ) -> Result<(), WorkerError> {
            thread::sleep(Duration::from_millis(600));
            Ok(())
        }
    }

    fn manager(specs: Vec<WorkerSpec>) -> WorkerManager {
        let settings = ManagerSettings {
            monitor_interval: Duration::from_millis(20),
            restart_join_timeout: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(1),
        };
        WorkerManager::new(Arc::new(InMemoryJobStore::new()), settings, specs)
    }

    #[test]
    fn start_status_and_stop() {
        let builds = Arc::new(AtomicUsize::new(0));
        let resets = Arc::new(Mutex::new(Vec::new()));
        let manager = manager(vec![
            flaky_spec(usize::MAX, 10, builds.clone(), resets.clone()),
            flaky_spec(usize::MAX, 10, builds.clone(), resets.clone()),
        ]);

        manager.start_all();
        manager.start_all();
        assert_eq!(builds.load(Ordering::SeqCst), 2);

        assert!(wait_until(Duration::from_secs(2), || manager.status().healthy_workers == 2));
        let status = manager.status();
        assert!(status.manager_running);
        assert_eq!(status.total_workers, 2);
        assert_eq!(status.alive_workers, 2);

        manager.stop_all();
        let status = manager.status();
        assert!(!status.manager_running);
        assert_eq!(status.total_workers, 0);
        assert_eq!(lock(&resets).len(), 2);
    }

    #[test]
    fn dead_workers_are_replaced_and_their_jobs_released() {
        let builds = Arc::new(AtomicUsize::new(0));
        let resets = Arc::new(Mutex::new(Vec::new()));
        let manager = manager(vec![dies_once_spec(builds.clone(), resets.clone())]);

        manager.start_all();
        let first = manager.status().workers[0].id;
        assert!(wait_until(Duration::from_secs(2), || !manager.status().workers[0].alive));

        let tick_at = Utc::now();
        let report = manager.monitor_tick();
        assert_eq!(report.restarted, 1);
        assert_eq!(builds.load(Ordering::SeqCst), 2);

        let second = manager.status().workers[0].id;
        assert_ne!(first, second);
        assert!(wait_until(Duration::from_secs(2), || {
            let status = manager.status();
            let replacement = &status.workers[0];
            replacement.alive && replacement.last_heartbeat.is_some_and(|beat| beat >= tick_at)
        }));
        // Own cleanup of the dead instance, then the replacement releasing it.
        assert!(wait_until(Duration::from_secs(2), || {
            lock(&resets).iter().filter(|id| **id == first).count() == 2
        }));

        manager.stop_all();
    }

    #[test]
    fn monitor_thread_restarts_workers_in_the_background() {
        let builds = Arc::new(AtomicUsize::new(0));
        let resets = Arc::new(Mutex::new(Vec::new()));
        let manager = manager(vec![flaky_spec(0, 1, builds.clone(), resets)]);

        manager.start_all();
        manager.spawn_monitor().unwrap();
        assert!(wait_until(Duration::from_secs(3), || builds.load(Ordering::SeqCst) >= 3));

        manager.stop_all();
        let settled = builds.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(builds.load(Ordering::SeqCst), settled);
    }

    #[test]
    fn status_is_not_blocked_while_a_stale_worker_is_joined() {
        let runtime = RuntimeSettings::new(Duration::from_millis(5))
            .with_health_timeout(Duration::from_millis(20));
        let manager = manager(vec![
            WorkerSpec::new("stuck", runtime, || Box::new(Stuck) as Box<dyn Worker>),
            flaky_spec(usize::MAX, 10, Arc::new(AtomicUsize::new(0)), Arc::new(Mutex::new(Vec::new()))),
        ]);
        manager.start_all();
        thread::sleep(Duration::from_millis(100));

        let ticking = manager.clone();
        let tick = thread::spawn(move || ticking.monitor_tick());
        thread::sleep(Duration::from_millis(100));

        let asked = std::time::Instant::now();
        let status = manager.status();
        assert!(asked.elapsed() < Duration::from_millis(250));
        assert_eq!(status.total_workers, 2);

        let report = tick.join().unwrap();
        assert_eq!(report.restarted, 1);
        manager.stop_all();
    }

    #[test]
    fn status_serializes_for_the_outside_world() {
        let manager = manager(Vec::new());
        let json = serde_json::to_value(manager.status()).unwrap();
        assert_eq!(json["manager_running"], false);
        assert_eq!(json["total_workers"], 0);
        assert!(json["timestamp"].is_string());
    }
}
