// CLASSIFICATION: COMMUNITY
// Filename: monitor.rs v0.2
// Author: Lukas Bower
// Date Modified: 2027-08-27

//! Watchdog over busy workers.
//!
//! Past the deadline a slice's token is cancelled so the runtime's next
//! checkpoint unwinds. Past deadline plus the abort grace the worker is
//! written off: its computer is marked for teardown, its network operations
//! are cancelled and a replacement worker keeps the pool at full size.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use log::{debug, error, warn};

use super::Shared;
use crate::computer::{Computer, ComputerState};
use crate::metrics::SchedulerMetrics;

pub(super) fn run(shared: Arc<Shared>) {
    let interval = shared.settings.monitor_interval;
    while shared.is_running() {
        thread::sleep(interval);
        scan(&shared, Instant::now());
    }
    debug!("monitor stopped");
}

/// One watchdog pass. Returns the number of workers abandoned.
pub(crate) fn scan(shared: &Arc<Shared>, now: Instant) -> usize {
    let grace = shared.settings.abort_grace;
    let mut stuck: Vec<(usize, Arc<Computer>)> = Vec::new();
    for (worker, slot) in shared.slots().iter() {
        if now < slot.deadline {
            continue;
        }
        if !slot.token.is_cancelled() {
            slot.token.cancel();
            SchedulerMetrics::bump(&shared.metrics.interrupts);
            debug!("computer #{} interrupted on worker {worker}", slot.computer.id());
        }
        if now >= slot.deadline + grace
            && !slot.abandoned.swap(true, Ordering::AcqRel)
        {
            stuck.push((*worker, Arc::clone(&slot.computer)));
        }
    }

    for (worker, computer) in &stuck {
        warn!(
            "worker {worker} stuck on computer #{} past the abort grace, abandoning it",
            computer.id()
        );
        SchedulerMetrics::bump(&shared.metrics.hard_aborts);
        computer.set_state(ComputerState::Stopping);
        shared.services.gateway.cancel_all(computer.id());
        shared.detach_worker(*worker);
        if shared.is_running() {
            if let Err(e) = shared.spawn_worker() {
                error!("failed to spawn replacement for worker {worker}: {e}");
            }
        }
    }
    stuck.len()
}
