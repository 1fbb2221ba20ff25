//! Client activity counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for scheduling and fetch activity since the client was created.
#[derive(Debug, Default)]
pub struct ClientMetrics {
    /// Evaluation passes run
    pub evaluations: AtomicU64,
    /// Fetch attempts started
    pub fetches_dispatched: AtomicU64,
    /// Fetch attempts that produced data
    pub data_received: AtomicU64,
    /// Fetch attempts that failed, including timeouts
    pub errors_received: AtomicU64,
    /// Fetch attempts that hit their timeout
    pub timeouts: AtomicU64,
    /// Wake timers scheduled
    pub timer_reschedules: AtomicU64,
    /// Wake timers cancelled without replacement
    pub timer_clears: AtomicU64,
    /// External state replacements accepted
    pub state_replacements: AtomicU64,
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> ClientMetricsSnapshot {
        ClientMetricsSnapshot {
            evaluations: self.evaluations.load(Ordering::Relaxed),
            fetches_dispatched: self.fetches_dispatched.load(Ordering::Relaxed),
            data_received: self.data_received.load(Ordering::Relaxed),
            errors_received: self.errors_received.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            timer_reschedules: self.timer_reschedules.load(Ordering::Relaxed),
            timer_clears: self.timer_clears.load(Ordering::Relaxed),
            state_replacements: self.state_replacements.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of client metrics at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientMetricsSnapshot {
    pub evaluations: u64,
    pub fetches_dispatched: u64,
    pub data_received: u64,
    pub errors_received: u64,
    pub timeouts: u64,
    pub timer_reschedules: u64,
    pub timer_clears: u64,
    pub state_replacements: u64,
}

impl ClientMetricsSnapshot {
    /// Fetch attempts dispatched but not yet settled.
    pub fn in_flight(&self) -> u64 {
        self.fetches_dispatched
            .saturating_sub(self.data_received + self.errors_received)
    }
}
