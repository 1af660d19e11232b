// CLASSIFICATION: COMMUNITY
// Filename: mod.rs v0.1
// Author: Lukas Bower
// Date Modified: 2027-08-30

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use computer_core::computer::{runtime_factory, ResumeOutcome, RuntimeFactory, ScriptRuntime};
use computer_core::net::{HostResolver, StaticResolver};
use computer_core::scheduler::Slice;
use computer_core::{ComputerHost, CoreConfig, Event};
use tempfile::TempDir;

/// Small, fast configuration with loopback traffic allowed.
pub fn test_config() -> CoreConfig {
    let mut cfg = CoreConfig::default();
    cfg.execution.computer_threads = 2;
    cfg.execution.max_main_computer_time_ms = 20;
    cfg.execution.max_main_global_time_ms = 200;
    cfg.execution.abort_grace_ms = 200;
    cfg.http.blacklist = Vec::new();
    cfg.http.timeout_ms = 1500;
    cfg.http.io_threads = 4;
    cfg
}

pub fn start_host(cfg: CoreConfig, factory: RuntimeFactory) -> (ComputerHost, TempDir) {
    start_host_with(cfg, factory, Arc::new(StaticResolver::new()))
}

pub fn start_host_with(
    cfg: CoreConfig,
    factory: RuntimeFactory,
    resolver: Arc<dyn HostResolver>,
) -> (ComputerHost, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let host = ComputerHost::with_resolver(cfg, dir.path(), factory, resolver).unwrap();
    (host, dir)
}

/// Drive host ticks until `cond` holds or `timeout` passes.
pub fn tick_until(host: &ComputerHost, timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let give_up = Instant::now() + timeout;
    loop {
        host.scheduler_tick();
        if cond() {
            return true;
        }
        if Instant::now() >= give_up {
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
}

/// Runtime built from a closure over the slice.
pub struct FnRuntime<F>(pub F);

impl<F> ScriptRuntime for FnRuntime<F>
where
    F: FnMut(&mut Slice<'_>) -> ResumeOutcome + Send,
{
    fn resume(&mut self, slice: &mut Slice<'_>) -> ResumeOutcome {
        (self.0)(slice)
    }
}

/// Wrap a closure as a runtime.
pub fn script<F>(f: F) -> FnRuntime<F>
where
    F: FnMut(&mut Slice<'_>) -> ResumeOutcome + Send,
{
    FnRuntime(f)
}

pub type EventLog = Arc<Mutex<Vec<Event>>>;

/// Runtime that records every event it is handed and then idles.
pub struct Recorder {
    log: EventLog,
}

impl ScriptRuntime for Recorder {
    fn resume(&mut self, slice: &mut Slice<'_>) -> ResumeOutcome {
        while let Some(event) = slice.pop_event() {
            self.log.lock().unwrap().push(event);
        }
        ResumeOutcome::Completed
    }
}

pub fn recorder() -> (RuntimeFactory, EventLog) {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let shared = Arc::clone(&log);
    let factory = runtime_factory(move |_| Recorder {
        log: Arc::clone(&shared),
    });
    (factory, log)
}

pub fn events(log: &EventLog) -> Vec<Event> {
    log.lock().unwrap().clone()
}
