// CLASSIFICATION: COMMUNITY
// Filename: metrics.rs v0.2
// Author: Lukas Bower
// Date Modified: 2027-08-25

//! Scheduler and gateway counters, serialisable for host diagnostics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};

#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    pub resumes: AtomicU64,
    pub boots: AtomicU64,
    pub soft_faults: AtomicU64,
    pub runtime_faults: AtomicU64,
    pub interrupts: AtomicU64,
    pub hard_aborts: AtomicU64,
    pub workers_spawned: AtomicU64,
    pub ticks: AtomicU64,
    pub deferred_ticks: AtomicU64,
    last_tick_consumed_us: AtomicU64,
}

impl SchedulerMetrics {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_tick(&self, consumed: Duration, deferred: bool) {
        Self::bump(&self.ticks);
        if deferred {
            Self::bump(&self.deferred_ticks);
        }
        self.last_tick_consumed_us
            .store(consumed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn last_tick_consumed(&self) -> Duration {
        Duration::from_micros(self.last_tick_consumed_us.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> Value {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        json!({
            "resumes": get(&self.resumes),
            "boots": get(&self.boots),
            "soft_faults": get(&self.soft_faults),
            "runtime_faults": get(&self.runtime_faults),
            "interrupts": get(&self.interrupts),
            "hard_aborts": get(&self.hard_aborts),
            "workers_spawned": get(&self.workers_spawned),
            "ticks": get(&self.ticks),
            "deferred_ticks": get(&self.deferred_ticks),
            "last_tick_consumed_us": get(&self.last_tick_consumed_us),
        })
    }
}

#[derive(Debug, Default)]
pub struct GatewayMetrics {
    pub requests: AtomicU64,
    pub websockets: AtomicU64,
    pub denied: AtomicU64,
    pub rejected: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub timed_out: AtomicU64,
    pub cancelled: AtomicU64,
}

impl GatewayMetrics {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Value {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        json!({
            "requests": get(&self.requests),
            "websockets": get(&self.websockets),
            "denied": get(&self.denied),
            "rejected": get(&self.rejected),
            "succeeded": get(&self.succeeded),
            "failed": get(&self.failed),
            "timed_out": get(&self.timed_out),
            "cancelled": get(&self.cancelled),
        })
    }
}

/// Execution timings for one computer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ComputerTimings {
    pub resumes: u64,
    pub overruns: u64,
    #[serde(serialize_with = "as_micros")]
    pub total: Duration,
    #[serde(serialize_with = "as_micros")]
    pub max: Duration,
}

fn as_micros<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_micros() as u64)
}

impl ComputerTimings {
    pub(crate) fn record(&mut self, elapsed: Duration, overran: bool) {
        self.resumes += 1;
        self.total += elapsed;
        self.max = self.max.max(elapsed);
        if overran {
            self.overruns += 1;
        }
    }

    pub fn average(&self) -> Duration {
        if self.resumes == 0 {
            Duration::ZERO
        } else {
            self.total / self.resumes as u32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timings_track_max_and_average() {
        let mut t = ComputerTimings::default();
        t.record(Duration::from_millis(2), false);
        t.record(Duration::from_millis(6), true);
        assert_eq!(t.max, Duration::from_millis(6));
        assert_eq!(t.average(), Duration::from_millis(4));
        assert_eq!(t.overruns, 1);
        let json = serde_json::to_value(&t).unwrap();
        assert_eq!(json["total"], 8000);
    }

    #[test]
    fn tick_deferral_counted() {
        let m = SchedulerMetrics::default();
        m.record_tick(Duration::from_millis(3), true);
        m.record_tick(Duration::from_millis(1), false);
        let snap = m.snapshot();
        assert_eq!(snap["ticks"], 2);
        assert_eq!(snap["deferred_ticks"], 1);
        assert_eq!(snap["last_tick_consumed_us"], 1000);
    }
}
