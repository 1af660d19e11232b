// CLASSIFICATION: COMMUNITY
// Filename: queue.rs v0.3
// Author: Lukas Bower
// Date Modified: 2027-08-26

//! FIFO of runnable computers gated by the per-tick execution budget.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use log::debug;

use crate::computer::Computer;

/// Outcome of closing a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickStats {
    /// Index of the tick that just closed.
    pub tick: u64,
    /// Execution time charged to it.
    pub consumed: Duration,
    /// Work was left waiting because the budget ran out.
    pub deferred: bool,
    /// Computers still queued when the tick closed.
    pub queued: usize,
}

#[derive(Debug)]
struct QueueState {
    queue: VecDeque<Arc<Computer>>,
    tick: u64,
    consumed: Duration,
    budget: Duration,
    exhausted: bool,
    stopping: bool,
}

#[derive(Debug)]
pub struct RunQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl RunQueue {
    pub fn new(global_budget: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                tick: 0,
                consumed: Duration::ZERO,
                budget: global_budget,
                exhausted: false,
                stopping: false,
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn push(&self, computer: Arc<Computer>) {
        let mut st = self.lock();
        if st.stopping {
            computer.clear_queued();
            return;
        }
        st.queue.push_back(computer);
        drop(st);
        self.ready.notify_one();
    }

    /// Block until a computer may run in the current tick. Returns the
    /// computer and the tick its slice is charged to, or `None` once the
    /// queue is stopped.
    pub(crate) fn pop(&self) -> Option<(Arc<Computer>, u64)> {
        let mut st = self.lock();
        loop {
            if st.stopping {
                return None;
            }
            if st.consumed >= st.budget {
                if !st.queue.is_empty() && !st.exhausted {
                    st.exhausted = true;
                    debug!("tick {} budget exhausted, {} deferred", st.tick, st.queue.len());
                }
            } else if let Some(computer) = st.queue.pop_front() {
                return Some((computer, st.tick));
            }
            st = self.ready.wait(st).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Charge a finished slice to the tick it started in. Slices that
    /// straddle a tick boundary do not eat into the new tick.
    pub(crate) fn charge(&self, tick: u64, elapsed: Duration) {
        let mut st = self.lock();
        if st.tick == tick {
            st.consumed += elapsed;
        }
    }

    /// Close the current tick and restore the budget.
    pub fn tick(&self) -> TickStats {
        let mut st = self.lock();
        let stats = TickStats {
            tick: st.tick,
            consumed: st.consumed,
            deferred: st.exhausted || (st.consumed >= st.budget && !st.queue.is_empty()),
            queued: st.queue.len(),
        };
        st.tick += 1;
        st.consumed = Duration::ZERO;
        st.exhausted = false;
        drop(st);
        self.ready.notify_all();
        stats
    }

    pub fn set_global_budget(&self, budget: Duration) {
        self.lock().budget = budget;
        self.ready.notify_all();
    }

    pub fn global_budget(&self) -> Duration {
        self.lock().budget
    }

    pub fn consumed(&self) -> Duration {
        self.lock().consumed
    }

    pub fn current_tick(&self) -> u64 {
        self.lock().tick
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// Wake every waiting worker and refuse further work.
    pub(crate) fn stop(&self) {
        let mut st = self.lock();
        st.stopping = true;
        for computer in st.queue.drain(..) {
            computer.clear_queued();
        }
        drop(st);
        self.ready.notify_all();
    }
}
