// CLASSIFICATION: COMMUNITY
// Filename: scheduler.rs v0.2
// Author: Lukas Bower
// Date Modified: 2027-08-30

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use computer_core::computer::{runtime_factory, ResumeOutcome, RuntimeFault, ScriptRuntime};
use computer_core::scheduler::Slice;
use computer_core::{ComputerState, Event, FaultKind};

use common::{events, recorder, start_host, test_config, tick_until, script};

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn boots_and_delivers_events_in_order() {
    let (factory, log) = recorder();
    let (host, _dir) = start_host(test_config(), factory);
    let computer = host.create_computer().unwrap();
    computer.turn_on();
    assert!(tick_until(&host, WAIT, || computer.state() == ComputerState::On));

    for i in 0..5 {
        assert!(host.queue_event(computer.id(), Event::custom(&format!("e{i}"), vec![])).unwrap());
    }
    assert!(tick_until(&host, WAIT, || events(&log).len() == 5));
    let names: Vec<String> = events(&log).iter().map(|e| e.name().to_string()).collect();
    assert_eq!(names, vec!["e0", "e1", "e2", "e3", "e4"]);
}

#[test]
fn events_for_off_computer_are_dropped() {
    let (factory, _log) = recorder();
    let (host, _dir) = start_host(test_config(), factory);
    let computer = host.create_computer().unwrap();
    assert!(!host.queue_event(computer.id(), Event::custom("ignored", vec![])).unwrap());
    assert_eq!(computer.pending_events(), 0);
}

#[test]
fn overrun_surfaces_soft_fault_then_recovers() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let resumes = Arc::new(AtomicU32::new(0));
    let factory = {
        let seen = Arc::clone(&seen);
        let resumes = Arc::clone(&resumes);
        runtime_factory(move |_| {
            let seen = Arc::clone(&seen);
            let resumes = Arc::clone(&resumes);
            script(move |slice| {
                if resumes.fetch_add(1, Ordering::SeqCst) == 0 {
                    thread::sleep(Duration::from_millis(40));
                    return ResumeOutcome::Yielded;
                }
                while let Some(event) = slice.pop_event() {
                    seen.lock().unwrap().push(event);
                }
                ResumeOutcome::Completed
            })
        })
    };
    let (host, _dir) = start_host(test_config(), factory);
    let computer = host.create_computer().unwrap();
    computer.turn_on();

    assert!(tick_until(&host, WAIT, || !seen.lock().unwrap().is_empty()));
    assert_eq!(
        seen.lock().unwrap()[0],
        Event::fault(FaultKind::SoftFault, "Too long without yielding")
    );
    assert_eq!(computer.state(), ComputerState::On);
    assert!(computer.timings().overruns >= 1);
}

#[test]
fn repeated_soft_faults_turn_computer_off() {
    let factory = runtime_factory(|_| {
        script(|_slice| {
            thread::sleep(Duration::from_millis(30));
            ResumeOutcome::Yielded
        })
    });
    let (host, _dir) = start_host(test_config(), factory);
    let computer = host.create_computer().unwrap();
    computer.turn_on();
    assert!(tick_until(&host, WAIT, || computer.state() == ComputerState::On));
    assert!(tick_until(&host, WAIT, || computer.state() == ComputerState::Off));

    let metrics = host.scheduler().metrics().snapshot();
    assert!(metrics["soft_faults"].as_u64().unwrap() >= 3);
}

#[test]
fn checkpoint_interrupts_greedy_runtime() {
    let factory = runtime_factory(|_| {
        script(|slice| {
            while slice.checkpoint().is_ok() {
                std::hint::spin_loop();
            }
            ResumeOutcome::Yielded
        })
    });
    let (host, _dir) = start_host(test_config(), factory);
    let computer = host.create_computer().unwrap();
    computer.turn_on();
    assert!(tick_until(&host, WAIT, || computer.state() == ComputerState::On));
    assert!(tick_until(&host, WAIT, || computer.state() == ComputerState::Off));
    assert_eq!(host.scheduler().metrics().snapshot()["hard_aborts"], 0);
}

#[test]
fn recoverable_fault_is_reported_and_fatal_fault_stops() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let factory = {
        let seen = Arc::clone(&seen);
        runtime_factory(move |_| {
            let seen = Arc::clone(&seen);
            script(move |slice| {
                while let Some(event) = slice.pop_event() {
                    let name = event.name().to_string();
                    seen.lock().unwrap().push(event);
                    match name.as_str() {
                        "oops" => return ResumeOutcome::Faulted(RuntimeFault::recoverable("bad arg")),
                        "die" => return ResumeOutcome::Faulted(RuntimeFault::fatal("stack overflow")),
                        _ => {}
                    }
                }
                ResumeOutcome::Completed
            })
        })
    };
    let (host, _dir) = start_host(test_config(), factory);
    let computer = host.create_computer().unwrap();
    computer.turn_on();
    assert!(tick_until(&host, WAIT, || computer.state() == ComputerState::On));

    computer.queue_event(Event::custom("oops", vec![]));
    assert!(tick_until(&host, WAIT, || seen.lock().unwrap().len() == 2));
    assert_eq!(
        seen.lock().unwrap()[1],
        Event::fault(FaultKind::RuntimeError, "bad arg")
    );
    assert_eq!(computer.state(), ComputerState::On);

    computer.queue_event(Event::custom("die", vec![]));
    assert!(tick_until(&host, WAIT, || computer.state() == ComputerState::Off));
}

#[test]
fn panicking_runtime_is_contained() {
    let factory = runtime_factory(|id| {
        script(move |slice| {
            if id == 0 {
                panic!("runtime bug");
            }
            while slice.pop_event().is_some() {}
            ResumeOutcome::Completed
        })
    });
    let (host, _dir) = start_host(test_config(), factory);
    let bad = host.create_computer().unwrap();
    let good = host.create_computer().unwrap();
    bad.turn_on();
    good.turn_on();
    assert!(tick_until(&host, WAIT, || bad.state() == ComputerState::Off
        && good.state() == ComputerState::On));
    assert_eq!(host.scheduler().worker_count(), 2);
    assert!(good.queue_event(Event::custom("still_alive", vec![])));
    assert!(tick_until(&host, WAIT, || good.pending_events() == 0));
}

#[test]
fn reboot_builds_a_fresh_runtime() {
    let boots = Arc::new(AtomicU32::new(0));
    let factory = {
        let boots = Arc::clone(&boots);
        runtime_factory(move |_| {
            boots.fetch_add(1, Ordering::SeqCst);
            script(|_slice| ResumeOutcome::Completed)
        })
    };
    let (host, _dir) = start_host(test_config(), factory);
    let computer = host.create_computer().unwrap();
    let built = boots.load(Ordering::SeqCst);
    computer.turn_on();
    assert!(tick_until(&host, WAIT, || computer.state() == ComputerState::On));

    host.reboot(computer.id()).unwrap();
    assert!(tick_until(&host, WAIT, || computer.state() == ComputerState::On
        && boots.load(Ordering::SeqCst) > built));
    assert_eq!(host.scheduler().metrics().snapshot()["boots"], 2);
}

#[test]
fn script_can_request_shutdown() {
    let factory = runtime_factory(|_| {
        script(|slice| {
            while let Some(event) = slice.pop_event() {
                if event.name() == "power_off" {
                    slice.request_shutdown();
                }
            }
            ResumeOutcome::Completed
        })
    });
    let (host, _dir) = start_host(test_config(), factory);
    let computer = host.create_computer().unwrap();
    computer.turn_on();
    assert!(tick_until(&host, WAIT, || computer.state() == ComputerState::On));
    computer.queue_event(Event::custom("power_off", vec![]));
    assert!(tick_until(&host, WAIT, || computer.state() == ComputerState::Off));
}

#[test]
fn global_budget_defers_remaining_work() {
    let mut cfg = test_config();
    cfg.execution.max_main_global_time_ms = 20;
    cfg.execution.max_main_computer_time_ms = 20;
    let factory = runtime_factory(|_| {
        script(|slice| {
            let start = Instant::now();
            while start.elapsed() < Duration::from_millis(8) && slice.checkpoint().is_ok() {
                std::hint::spin_loop();
            }
            ResumeOutcome::Yielded
        })
    });
    let (host, _dir) = start_host(cfg, factory);
    for _ in 0..4 {
        host.create_computer().unwrap().turn_on();
    }
    thread::sleep(Duration::from_millis(150));

    // No tick has been closed, so at most one in-flight slice per worker
    // can run past the budget.
    let consumed = host.scheduler().run_queue().consumed();
    assert!(consumed >= Duration::from_millis(20));
    assert!(consumed < Duration::from_millis(20 + 2 * 30));
    assert!(host.scheduler().remaining_budget().is_err());

    let report = host.scheduler_tick();
    assert!(report.deferred);
    assert!(report.queued > 0);
    assert!(host.scheduler().remaining_budget().is_ok());
}

#[test]
fn stuck_worker_is_replaced() {
    let mut cfg = test_config();
    cfg.execution.computer_threads = 1;
    cfg.execution.abort_grace_ms = 100;
    let (record, log) = recorder();
    let factory = runtime_factory(move |id| {
        let mut inner = record(id);
        script(move |slice| {
            if id == 0 {
                thread::sleep(Duration::from_millis(600));
                return ResumeOutcome::Yielded;
            }
            inner.resume(slice)
        })
    });
    let (host, _dir) = start_host(cfg, factory);
    let stuck = host.create_computer().unwrap();
    let healthy = host.create_computer().unwrap();
    healthy.turn_on();
    assert!(tick_until(&host, WAIT, || healthy.state() == ComputerState::On));
    stuck.turn_on();
    assert!(tick_until(&host, WAIT, || {
        host.scheduler().metrics().snapshot()["hard_aborts"] == 1
    }));

    healthy.queue_event(Event::custom("served", vec![]));
    assert!(tick_until(&host, Duration::from_millis(400), || !events(&log).is_empty()));
    assert!(tick_until(&host, WAIT, || stuck.state() == ComputerState::Off));
    assert_eq!(host.scheduler().worker_count(), 1);
    assert!(host.scheduler().metrics().snapshot()["workers_spawned"].as_u64().unwrap() >= 2);
}

#[test]
fn one_computer_never_runs_on_two_workers() {
    let mut cfg = test_config();
    cfg.execution.computer_threads = 4;
    let active = Arc::new(AtomicU32::new(0));
    let overlaps = Arc::new(AtomicU32::new(0));
    let resumes = Arc::new(AtomicU32::new(0));
    let factory = {
        let (active, overlaps, resumes) = (
            Arc::clone(&active),
            Arc::clone(&overlaps),
            Arc::clone(&resumes),
        );
        runtime_factory(move |_| {
            let (active, overlaps, resumes) = (
                Arc::clone(&active),
                Arc::clone(&overlaps),
                Arc::clone(&resumes),
            );
            script(move |slice| {
                if active.fetch_add(1, Ordering::SeqCst) != 0 {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                resumes.fetch_add(1, Ordering::SeqCst);
                while slice.pop_event().is_some() {}
                thread::sleep(Duration::from_micros(200));
                active.fetch_sub(1, Ordering::SeqCst);
                ResumeOutcome::Yielded
            })
        })
    };
    let (host, _dir) = start_host(cfg, factory);
    let computer = host.create_computer().unwrap();
    computer.turn_on();
    assert!(tick_until(&host, WAIT, || computer.state() == ComputerState::On));

    let producers: Vec<_> = (0..3)
        .map(|p| {
            let computer = Arc::clone(&computer);
            thread::spawn(move || {
                for i in 0..200 {
                    computer.queue_event(Event::custom(&format!("p{p}-{i}"), vec![]));
                    if i % 20 == 0 {
                        thread::yield_now();
                    }
                }
            })
        })
        .collect();
    assert!(tick_until(&host, WAIT, || resumes.load(Ordering::SeqCst) >= 300));
    for producer in producers {
        producer.join().unwrap();
    }
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(host.scheduler().metrics().snapshot()["hard_aborts"], 0);
}

struct CountsShutdowns {
    shutdowns: Arc<AtomicU32>,
}

impl ScriptRuntime for CountsShutdowns {
    fn resume(&mut self, _slice: &mut Slice<'_>) -> ResumeOutcome {
        ResumeOutcome::Completed
    }

    fn shutdown(&mut self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn host_stop_runs_runtime_shutdown() {
    let shutdowns = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&shutdowns);
    let factory = runtime_factory(move |_| CountsShutdowns {
        shutdowns: Arc::clone(&counter),
    });
    let (host, _dir) = start_host(test_config(), factory);
    let computers: Vec<_> = (0..3).map(|_| host.create_computer().unwrap()).collect();
    for computer in &computers {
        computer.turn_on();
    }
    assert!(tick_until(&host, WAIT, || {
        computers.iter().all(|c| c.state() == ComputerState::On)
    }));

    host.stop();
    assert_eq!(shutdowns.load(Ordering::SeqCst), 3);
    assert!(computers.iter().all(|c| c.state() == ComputerState::Off));
}
