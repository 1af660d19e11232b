// CLASSIFICATION: COMMUNITY
// Filename: mod.rs v0.5
// Author: Lukas Bower
// Date Modified: 2027-08-26

//! Execution scheduler.
//!
//! A fixed pool of worker threads resumes runnable computers in FIFO order.
//! Each resume gets the per-computer budget; all resumes started in one host
//! tick share the global budget. A monitor thread interrupts slices that run
//! past their deadline and abandons workers stuck beyond the abort grace.

pub mod monitor;
mod queue;
mod slice;
mod worker;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

pub use queue::{RunQueue, TickStats};
pub use slice::{CancelToken, Interrupted, Services, Slice};

use crate::computer::{Computer, ComputerState};
use crate::config::ExecutionConfig;
use crate::error::{CoreError, CoreResult};
use crate::metrics::SchedulerMetrics;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub workers: usize,
    pub computer_budget: Duration,
    pub global_budget: Duration,
    pub soft_fault_limit: u32,
    pub abort_grace: Duration,
    pub monitor_interval: Duration,
}

impl From<&ExecutionConfig> for SchedulerSettings {
    fn from(cfg: &ExecutionConfig) -> Self {
        Self {
            workers: cfg.worker_count(),
            computer_budget: cfg.computer_budget(),
            global_budget: cfg.global_budget(),
            soft_fault_limit: cfg.soft_fault_limit,
            abort_grace: cfg.abort_grace(),
            monitor_interval: cfg.monitor_interval(),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&ExecutionConfig::default())
    }
}

/// A worker's binding to the computer it is resuming.
pub(crate) struct Slot {
    pub(crate) computer: Arc<Computer>,
    pub(crate) deadline: Instant,
    pub(crate) token: CancelToken,
    pub(crate) abandoned: Arc<AtomicBool>,
}

pub(crate) struct Shared {
    pub(crate) settings: SchedulerSettings,
    pub(crate) queue: Arc<RunQueue>,
    pub(crate) services: Services,
    pub(crate) metrics: Arc<SchedulerMetrics>,
    slots: Mutex<HashMap<usize, Slot>>,
    workers: Mutex<HashMap<usize, JoinHandle<()>>>,
    next_worker: AtomicUsize,
    running: AtomicBool,
}

impl Shared {
    pub(crate) fn slots(&self) -> MutexGuard<'_, HashMap<usize, Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<usize, JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn spawn_worker(self: &Arc<Self>) -> std::io::Result<usize> {
        let id = self.next_worker.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::clone(self);
        let mut workers = self.workers();
        let handle = thread::Builder::new()
            .name(format!("computer-worker-{id}"))
            .spawn(move || worker::run(shared, id))?;
        workers.insert(id, handle);
        SchedulerMetrics::bump(&self.metrics.workers_spawned);
        Ok(id)
    }

    /// Forget a worker without joining it.
    pub(crate) fn detach_worker(&self, id: usize) {
        if self.workers().remove(&id).is_some() {
            debug!("worker {id} detached");
        }
    }
}

/// Point-in-time view of one busy worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotView {
    pub worker: usize,
    pub computer: u32,
    pub overdue: bool,
}

pub struct Scheduler {
    shared: Arc<Shared>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawn the worker pool and the monitor thread.
    pub fn start(settings: SchedulerSettings, services: Services) -> CoreResult<Self> {
        let shared = Arc::new(Shared {
            queue: Arc::new(RunQueue::new(settings.global_budget)),
            settings,
            services,
            metrics: Arc::new(SchedulerMetrics::default()),
            slots: Mutex::new(HashMap::new()),
            workers: Mutex::new(HashMap::new()),
            next_worker: AtomicUsize::new(0),
            running: AtomicBool::new(true),
        });
        for _ in 0..shared.settings.workers.max(1) {
            shared.spawn_worker()?;
        }
        let monitor = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("computer-monitor".into())
                .spawn(move || monitor::run(shared))?
        };
        info!(
            "scheduler started: {} workers, {:?} per computer, {:?} per tick",
            shared.settings.workers.max(1),
            shared.settings.computer_budget,
            shared.settings.global_budget
        );
        Ok(Self {
            shared,
            monitor: Mutex::new(Some(monitor)),
        })
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.shared.settings
    }

    /// Queue new computers must be created against.
    pub fn run_queue(&self) -> Arc<RunQueue> {
        Arc::clone(&self.shared.queue)
    }

    pub fn metrics(&self) -> Arc<SchedulerMetrics> {
        Arc::clone(&self.shared.metrics)
    }

    /// Close the current tick and give the workers a fresh global budget.
    pub fn tick(&self) -> TickStats {
        let stats = self.shared.queue.tick();
        self.shared.metrics.record_tick(stats.consumed, stats.deferred);
        if stats.deferred {
            debug!(
                "tick {} deferred {} computers after {:?}",
                stats.tick, stats.queued, stats.consumed
            );
        }
        stats
    }

    /// Execution time left in the current tick.
    pub fn remaining_budget(&self) -> CoreResult<Duration> {
        let queue = &self.shared.queue;
        let consumed = queue.consumed();
        let budget = queue.global_budget();
        if consumed >= budget {
            return Err(CoreError::SchedulerOverrun);
        }
        Ok(budget - consumed)
    }

    pub fn worker_count(&self) -> usize {
        self.shared.workers().len()
    }

    pub fn busy_slots(&self) -> Vec<SlotView> {
        let now = Instant::now();
        let mut view: Vec<_> = self
            .shared
            .slots()
            .iter()
            .map(|(worker, slot)| SlotView {
                worker: *worker,
                computer: slot.computer.id(),
                overdue: now >= slot.deadline,
            })
            .collect();
        view.sort_by_key(|s| s.worker);
        view
    }

    /// Let queued shutdowns of `computers` run before the pool goes away.
    /// Waits at most the abort grace, restoring the global budget meanwhile.
    pub fn settle(&self, computers: &[Arc<Computer>]) {
        if !self.shared.is_running() {
            return;
        }
        let give_up = Instant::now() + self.shared.settings.abort_grace;
        loop {
            let pending = computers
                .iter()
                .filter(|c| c.state() != ComputerState::Off)
                .count();
            if pending == 0 {
                return;
            }
            if Instant::now() >= give_up {
                warn!("{pending} computers still running at shutdown");
                return;
            }
            self.shared.queue.tick();
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Stop the pool. Slices in progress are interrupted; workers that do not
    /// return within the abort grace are left detached.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shared.queue.stop();
        for slot in self.shared.slots().values() {
            slot.token.cancel();
        }
        let handles: Vec<_> = self.shared.workers().drain().collect();
        let give_up = Instant::now() + self.shared.settings.abort_grace;
        for (id, handle) in handles {
            while !handle.is_finished() && Instant::now() < give_up {
                thread::sleep(Duration::from_millis(1));
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    warn!("worker {id} panicked");
                }
            } else {
                warn!("worker {id} did not stop, leaving it detached");
            }
        }
        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = monitor {
            let _ = handle.join();
        }
        info!("scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
