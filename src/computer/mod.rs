// CLASSIFICATION: COMMUNITY
// Filename: mod.rs v0.5
// Author: Lukas Bower
// Date Modified: 2027-08-25

//! The computer: one isolated script runtime with its own filesystem view,
//! event queue and quota registration.
//!
//! Only the thread holding a computer's execution lock touches its runtime,
//! filesystem and fault counters. The event queue and lifecycle fields accept
//! producers from any thread (network I/O, the host) and wake the scheduler
//! when work appears.

pub mod event;
pub mod filesystem;
pub mod registry;
pub mod runtime;

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, TryLockError};
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

pub use event::{Event, FaultKind, HandleId};
pub use filesystem::{FileHandle, FileSystem, OpenMode};
pub use registry::{ClientComputer, ClientComputerRegistry, ComputerRegistry, ComputerSnapshot, ServerComputerRegistry};
pub use runtime::{runtime_factory, ResumeOutcome, RuntimeFactory, RuntimeFault, ScriptRuntime};

use crate::error::CoreResult;
use crate::metrics::ComputerTimings;
use crate::quota::QuotaOwner;
use crate::scheduler::RunQueue;

pub type ComputerId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputerState {
    Off,
    Starting,
    On,
    Stopping,
}

impl ComputerState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ComputerState::Starting,
            2 => ComputerState::On,
            3 => ComputerState::Stopping,
            _ => ComputerState::Off,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ComputerState::Off => 0,
            ComputerState::Starting => 1,
            ComputerState::On => 2,
            ComputerState::Stopping => 3,
        }
    }
}

impl fmt::Display for ComputerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ComputerState::Off => "off",
            ComputerState::Starting => "starting",
            ComputerState::On => "on",
            ComputerState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Lifecycle command waiting for the next scheduled step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    Start,
    Stop,
    Reboot,
}

/// Removable-media change requested by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaChange {
    Mount {
        name: String,
        root: PathBuf,
        owner: QuotaOwner,
    },
    Unmount {
        name: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaOutcome {
    Applied,
    /// Unmount of a name that was not mounted.
    NotMounted,
    /// A resume holds the filesystem; the change lands before the next step.
    Deferred,
}

/// State owned by the execution-lock holder.
pub(crate) struct ExecState {
    pub(crate) runtime: Box<dyn ScriptRuntime>,
    pub(crate) fs: FileSystem,
    pub(crate) consecutive_faults: u32,
}

pub struct Computer {
    id: ComputerId,
    label: RwLock<Option<String>>,
    state: AtomicU8,
    command: Mutex<Option<Command>>,
    exec: Mutex<ExecState>,
    events: Mutex<VecDeque<Event>>,
    media: Mutex<VecDeque<MediaChange>>,
    queued: AtomicBool,
    mid_execution: AtomicBool,
    run_queue: Arc<RunQueue>,
    factory: RuntimeFactory,
    timings: Mutex<ComputerTimings>,
}

impl fmt::Debug for Computer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computer")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Computer {
    pub fn new(
        id: ComputerId,
        factory: RuntimeFactory,
        fs: FileSystem,
        run_queue: Arc<RunQueue>,
    ) -> Arc<Self> {
        let runtime = factory(id);
        Arc::new(Self {
            id,
            label: RwLock::new(None),
            state: AtomicU8::new(ComputerState::Off.as_u8()),
            command: Mutex::new(None),
            exec: Mutex::new(ExecState {
                runtime,
                fs,
                consecutive_faults: 0,
            }),
            events: Mutex::new(VecDeque::new()),
            media: Mutex::new(VecDeque::new()),
            queued: AtomicBool::new(false),
            mid_execution: AtomicBool::new(false),
            run_queue,
            factory,
            timings: Mutex::new(ComputerTimings::default()),
        })
    }

    pub fn id(&self) -> ComputerId {
        self.id
    }

    pub fn state(&self) -> ComputerState {
        ComputerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ComputerState) {
        let prev = ComputerState::from_u8(self.state.swap(state.as_u8(), Ordering::AcqRel));
        if prev != state {
            debug!("computer #{} {prev} -> {state}", self.id);
        }
    }

    /// Move from `from` to `to` only if nothing changed the state meanwhile.
    pub(crate) fn transition(&self, from: ComputerState, to: ComputerState) -> bool {
        let ok = self
            .state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if ok {
            debug!("computer #{} {from} -> {to}", self.id);
        }
        ok
    }

    pub fn is_on(&self) -> bool {
        self.state() == ComputerState::On
    }

    pub fn label(&self) -> Option<String> {
        self.label.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_label(&self, label: Option<String>) {
        *self.label.write().unwrap_or_else(|e| e.into_inner()) = label;
    }

    fn command_slot(&self) -> MutexGuard<'_, Option<Command>> {
        self.command.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn events(&self) -> MutexGuard<'_, VecDeque<Event>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn media(&self) -> MutexGuard<'_, VecDeque<MediaChange>> {
        self.media.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Request a boot. No-op unless the computer is off.
    pub fn turn_on(self: &Arc<Self>) {
        {
            let mut cmd = self.command_slot();
            if self.state() != ComputerState::Off || cmd.is_some() {
                return;
            }
            *cmd = Some(Command::Start);
            self.set_state(ComputerState::Starting);
        }
        info!("computer #{} starting", self.id);
        self.schedule();
    }

    /// Request an orderly shutdown. In-flight network operations are
    /// cancelled when the scheduler processes the request.
    pub fn shutdown(self: &Arc<Self>) {
        {
            let mut cmd = self.command_slot();
            match self.state() {
                ComputerState::Off => {
                    *cmd = None;
                    return;
                }
                ComputerState::Stopping if *cmd == Some(Command::Stop) => return,
                _ => {}
            }
            *cmd = Some(Command::Stop);
            self.set_state(ComputerState::Stopping);
        }
        info!("computer #{} stopping", self.id);
        self.schedule();
    }

    pub fn reboot(self: &Arc<Self>) {
        {
            let mut cmd = self.command_slot();
            *cmd = Some(match self.state() {
                ComputerState::Off => Command::Start,
                _ => Command::Reboot,
            });
            self.set_state(match *cmd {
                Some(Command::Start) => ComputerState::Starting,
                _ => ComputerState::Stopping,
            });
        }
        info!("computer #{} rebooting", self.id);
        self.schedule();
    }

    pub(crate) fn take_command(&self) -> Option<Command> {
        self.command_slot().take()
    }

    pub(crate) fn has_command(&self) -> bool {
        self.command_slot().is_some()
    }

    /// Append an event and wake the scheduler. Events for a computer that is
    /// off or stopping are dropped.
    pub fn queue_event(self: &Arc<Self>, event: Event) -> bool {
        match self.state() {
            ComputerState::Off | ComputerState::Stopping => return false,
            ComputerState::Starting | ComputerState::On => {}
        }
        self.events().push_back(event);
        self.schedule();
        true
    }

    /// Surface an error to the script as a [`Event::Fault`].
    pub fn push_error(self: &Arc<Self>, kind: FaultKind, message: impl Into<String>) -> bool {
        self.queue_event(Event::fault(kind, message))
    }

    pub(crate) fn pop_event(&self) -> Option<Event> {
        self.events().pop_front()
    }

    pub fn pending_events(&self) -> usize {
        self.events().len()
    }

    pub(crate) fn clear_events(&self) {
        self.events().clear();
    }

    pub(crate) fn set_mid_execution(&self, value: bool) {
        self.mid_execution.store(value, Ordering::Release);
    }

    /// True when a scheduled step would do something.
    pub fn has_work(&self) -> bool {
        if self.has_command() || !self.media().is_empty() {
            return true;
        }
        self.is_on()
            && (self.mid_execution.load(Ordering::Acquire) || self.pending_events() > 0)
    }

    /// Put the computer on the run queue unless it is already there.
    pub(crate) fn schedule(self: &Arc<Self>) {
        if !self.queued.swap(true, Ordering::AcqRel) {
            self.run_queue.push(Arc::clone(self));
        }
    }

    pub(crate) fn clear_queued(&self) {
        self.queued.store(false, Ordering::Release);
    }

    /// Take the execution lock without waiting.
    pub(crate) fn try_lock_exec(&self) -> Option<MutexGuard<'_, ExecState>> {
        match self.exec.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// True when some thread currently holds the execution lock.
    pub fn is_executing(&self) -> bool {
        matches!(self.exec.try_lock(), Err(TryLockError::WouldBlock))
    }

    /// Run `f` against the filesystem, waiting for any resume in progress.
    /// Blocks behind a runtime that ignores its checkpoints, so the host's
    /// tick path uses [`Computer::change_media`] instead.
    pub fn with_filesystem<T>(&self, f: impl FnOnce(&mut FileSystem) -> T) -> T {
        let mut exec = self.exec.lock().unwrap_or_else(|e| e.into_inner());
        self.apply_pending_media(&mut exec.fs);
        f(&mut exec.fs)
    }

    /// Mount or unmount media without waiting on the execution lock. When a
    /// resume is running the change is queued for the next scheduled step.
    pub fn change_media(self: &Arc<Self>, change: MediaChange) -> CoreResult<MediaOutcome> {
        if let Some(mut exec) = self.try_lock_exec() {
            self.apply_pending_media(&mut exec.fs);
            return apply_media(&mut exec.fs, change);
        }
        debug!("computer #{} busy, deferring {change:?}", self.id);
        self.media().push_back(change);
        self.schedule();
        Ok(MediaOutcome::Deferred)
    }

    /// Apply queued media changes. Called with the execution lock held.
    pub(crate) fn apply_pending_media(&self, fs: &mut FileSystem) {
        let pending: Vec<MediaChange> = self.media().drain(..).collect();
        for change in pending {
            if let Err(e) = apply_media(fs, change) {
                warn!("computer #{} deferred media change failed: {e}", self.id);
            }
        }
    }

    pub(crate) fn fresh_runtime(&self) -> Box<dyn ScriptRuntime> {
        (self.factory)(self.id)
    }

    pub(crate) fn record_timing(&self, elapsed: Duration, overran: bool) {
        self.timings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(elapsed, overran);
    }

    pub fn timings(&self) -> ComputerTimings {
        self.timings.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn snapshot(&self) -> ComputerSnapshot {
        ComputerSnapshot {
            id: self.id,
            state: self.state(),
            label: self.label(),
            pending_events: self.pending_events(),
        }
    }
}

fn apply_media(fs: &mut FileSystem, change: MediaChange) -> CoreResult<MediaOutcome> {
    match change {
        MediaChange::Mount { name, root, owner } => {
            fs.mount(&name, root, owner)?;
            Ok(MediaOutcome::Applied)
        }
        MediaChange::Unmount { name } => Ok(if fs.unmount(&name) {
            MediaOutcome::Applied
        } else {
            MediaOutcome::NotMounted
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::{QuotaLimits, QuotaOwner, QuotaTracker};
    use crate::scheduler::Slice;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    struct Idle;

    impl ScriptRuntime for Idle {
        fn resume(&mut self, _slice: &mut Slice<'_>) -> ResumeOutcome {
            ResumeOutcome::Completed
        }
    }

    fn computer(dir: &std::path::Path) -> Arc<Computer> {
        let quotas = QuotaTracker::new();
        quotas.register(
            QuotaOwner::Computer(1),
            QuotaLimits {
                filesystem_bytes: 100,
                open_file_handles: 1,
                network_requests: 1,
                websocket_connections: 1,
                websocket_message_bytes: 1,
            },
        );
        let fs = FileSystem::new(dir, QuotaOwner::Computer(1), quotas).unwrap();
        Computer::new(1, runtime_factory(|_| Idle), fs, Arc::new(RunQueue::new(Duration::from_millis(10))))
    }

    #[test]
    fn events_dropped_while_off() {
        let dir = tempfile::tempdir().unwrap();
        let c = computer(dir.path());
        assert!(!c.queue_event(Event::custom("x", vec![])));
        c.turn_on();
        assert_eq!(c.state(), ComputerState::Starting);
        assert!(c.queue_event(Event::custom("x", vec![])));
        assert_eq!(c.pending_events(), 1);
    }

    #[test]
    fn execution_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let c = computer(dir.path());
        let holders = Arc::new(AtomicUsize::new(0));
        let violations = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let c = Arc::clone(&c);
                let holders = Arc::clone(&holders);
                let violations = Arc::clone(&violations);
                thread::spawn(move || {
                    for _ in 0..2000 {
                        if let Some(_guard) = c.try_lock_exec() {
                            if holders.fetch_add(1, Ordering::SeqCst) != 0 {
                                violations.fetch_add(1, Ordering::SeqCst);
                            }
                            holders.fetch_sub(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(violations.load(Ordering::SeqCst), 0);
    }
}
