// CLASSIFICATION: COMMUNITY
// Filename: worker.rs v0.5
// Author: Lukas Bower
// Date Modified: 2027-08-27

//! Worker loop: dequeue, lock, step, release, reschedule.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, error, info, warn};

use super::{CancelToken, Shared, Slice, Slot};
use crate::computer::{
    Command, Computer, ComputerState, ExecState, FaultKind, ResumeOutcome, RuntimeFault,
};
use crate::metrics::SchedulerMetrics;

const SOFT_FAULT_MESSAGE: &str = "Too long without yielding";

pub(super) fn run(shared: Arc<Shared>, worker: usize) {
    debug!("worker {worker} started");
    while let Some((computer, tick)) = shared.queue.pop() {
        computer.clear_queued();
        match panic::catch_unwind(AssertUnwindSafe(|| execute(&shared, worker, &computer, tick))) {
            Ok(true) => {}
            Ok(false) => {
                debug!("worker {worker} exiting after abandonment");
                return;
            }
            Err(_) => {
                error!("worker {worker} died while running computer #{}", computer.id());
                shared.slots().remove(&worker);
                shared.detach_worker(worker);
                if shared.is_running() {
                    if let Err(e) = shared.spawn_worker() {
                        error!("failed to replace worker {worker}: {e}");
                    }
                }
                return;
            }
        }
    }
    debug!("worker {worker} stopped");
}

/// Run one step of `computer`. Returns `false` when the monitor gave up on
/// this worker and it must exit.
fn execute(shared: &Arc<Shared>, worker: usize, computer: &Arc<Computer>, tick: u64) -> bool {
    // The holder re-checks for work after unlocking, so skipping is safe.
    let Some(mut exec) = computer.try_lock_exec() else {
        return true;
    };
    computer.apply_pending_media(&mut exec.fs);
    let started = Instant::now();
    let token = CancelToken::new();
    let abandoned = Arc::new(AtomicBool::new(false));
    shared.slots().insert(
        worker,
        Slot {
            computer: Arc::clone(computer),
            deadline: started + shared.settings.computer_budget,
            token: token.clone(),
            abandoned: Arc::clone(&abandoned),
        },
    );

    step(shared, computer, &mut exec, started, &token);

    shared.slots().remove(&worker);
    shared.queue.charge(tick, started.elapsed());
    let abandoned = abandoned.load(Ordering::Acquire);
    if abandoned {
        halt(shared, computer, &mut exec, "aborted by watchdog");
    }
    drop(exec);
    if computer.has_work() {
        computer.schedule();
    }
    !abandoned
}

fn step(
    shared: &Shared,
    computer: &Arc<Computer>,
    exec: &mut ExecState,
    started: Instant,
    token: &CancelToken,
) {
    match computer.take_command() {
        Some(Command::Start) => return boot(shared, computer, exec, started, token),
        Some(Command::Stop) => return halt(shared, computer, exec, "shutdown"),
        Some(Command::Reboot) => {
            halt(shared, computer, exec, "reboot");
            computer.set_state(ComputerState::Starting);
            return boot(shared, computer, exec, started, token);
        }
        None => {}
    }
    if computer.is_on() {
        resume(shared, computer, exec, started, token);
    }
}

fn boot(
    shared: &Shared,
    computer: &Arc<Computer>,
    exec: &mut ExecState,
    started: Instant,
    token: &CancelToken,
) {
    SchedulerMetrics::bump(&shared.metrics.boots);
    exec.consecutive_faults = 0;
    let result = {
        let ExecState { runtime, fs, .. } = &mut *exec;
        let mut slice = Slice::new(
            computer,
            fs,
            &shared.services,
            started,
            shared.settings.computer_budget,
            token.clone(),
        );
        panic::catch_unwind(AssertUnwindSafe(|| runtime.boot(&mut slice)))
    };
    match result {
        Ok(Ok(())) => {
            if computer.transition(ComputerState::Starting, ComputerState::On) {
                computer.set_mid_execution(true);
                info!("computer #{} on", computer.id());
            }
        }
        Ok(Err(fault)) => {
            warn!("computer #{} failed to boot: {}", computer.id(), fault.message);
            halt(shared, computer, exec, "boot failure");
        }
        Err(_) => {
            warn!("computer #{} runtime panicked during boot", computer.id());
            halt(shared, computer, exec, "boot failure");
        }
    }
}

fn resume(
    shared: &Shared,
    computer: &Arc<Computer>,
    exec: &mut ExecState,
    started: Instant,
    token: &CancelToken,
) {
    let budget = shared.settings.computer_budget;
    let result = {
        let ExecState { runtime, fs, .. } = &mut *exec;
        let mut slice = Slice::new(computer, fs, &shared.services, started, budget, token.clone());
        panic::catch_unwind(AssertUnwindSafe(|| runtime.resume(&mut slice)))
    };
    let elapsed = started.elapsed();
    let overran = token.is_cancelled() || elapsed > budget;
    computer.record_timing(elapsed, overran);
    SchedulerMetrics::bump(&shared.metrics.resumes);

    let outcome = result
        .unwrap_or_else(|_| ResumeOutcome::Faulted(RuntimeFault::fatal("runtime panicked")));
    match outcome {
        ResumeOutcome::Yielded => computer.set_mid_execution(true),
        ResumeOutcome::Completed => computer.set_mid_execution(false),
        ResumeOutcome::Faulted(fault) => {
            SchedulerMetrics::bump(&shared.metrics.runtime_faults);
            computer.set_mid_execution(false);
            if fault.fatal {
                warn!("computer #{} fatal fault: {}", computer.id(), fault.message);
                return halt(shared, computer, exec, "fatal fault");
            }
            debug!("computer #{} runtime error: {}", computer.id(), fault.message);
            computer.push_error(FaultKind::RuntimeError, fault.message);
            return note_fault(shared, computer, exec);
        }
    }

    if overran {
        SchedulerMetrics::bump(&shared.metrics.soft_faults);
        warn!(
            "computer #{} soft fault: resume took {:?} (budget {:?})",
            computer.id(),
            elapsed,
            budget
        );
        computer.push_error(FaultKind::SoftFault, SOFT_FAULT_MESSAGE);
        note_fault(shared, computer, exec);
    } else {
        exec.consecutive_faults = 0;
    }
}

fn note_fault(shared: &Shared, computer: &Arc<Computer>, exec: &mut ExecState) {
    exec.consecutive_faults += 1;
    if exec.consecutive_faults >= shared.settings.soft_fault_limit {
        warn!(
            "computer #{} shut down after {} consecutive faults",
            computer.id(),
            exec.consecutive_faults
        );
        halt(shared, computer, exec, "too many faults");
    }
}

/// Tear the runtime down and turn the computer off. Must be called with the
/// execution lock held.
fn halt(shared: &Shared, computer: &Arc<Computer>, exec: &mut ExecState, reason: &str) {
    let ExecState {
        runtime,
        fs,
        consecutive_faults,
    } = exec;
    if panic::catch_unwind(AssertUnwindSafe(|| runtime.shutdown())).is_err() {
        warn!("computer #{} runtime panicked during shutdown", computer.id());
    }
    *runtime = computer.fresh_runtime();
    fs.close_all();
    *consecutive_faults = 0;
    let cancelled = shared.services.gateway.cancel_all(computer.id());
    computer.clear_events();
    computer.set_mid_execution(false);
    computer.set_state(ComputerState::Off);
    info!(
        "computer #{} off ({reason}, {cancelled} network operations cancelled)",
        computer.id()
    );
}
