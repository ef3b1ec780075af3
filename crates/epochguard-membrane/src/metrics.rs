//! Atomic counters for engine observability.
//!
//! All counters use relaxed ordering. They are advisory,
//! not synchronization primitives.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global engine counters.
pub struct GuardMetrics {
    /// Epochs begun (checkpoints taken).
    pub epochs: AtomicU64,
    /// Epochs that ended clean.
    pub commits: AtomicU64,
    /// Rollbacks performed.
    pub rollbacks: AtomicU64,
    /// Epoch boundaries forced by irrevocable calls.
    pub forced_commits: AtomicU64,
    /// Canary words found broken by a scan.
    pub overflow_findings: AtomicU64,
    /// Quarantined objects written after free.
    pub use_after_free_findings: AtomicU64,
    /// Unreachable live objects found by the leak scan.
    pub leaks: AtomicU64,
    /// Objects evicted from quarantine and released.
    pub quarantine_evictions: AtomicU64,
    /// Frees of foreign, already free or mangled pointers.
    pub invalid_frees: AtomicU64,
    /// Hardware watchpoint traps taken.
    pub watch_traps: AtomicU64,
}

impl GuardMetrics {
    /// Create a new zeroed metrics instance.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            epochs: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
            forced_commits: AtomicU64::new(0),
            overflow_findings: AtomicU64::new(0),
            use_after_free_findings: AtomicU64::new(0),
            leaks: AtomicU64::new(0),
            quarantine_evictions: AtomicU64::new(0),
            invalid_frees: AtomicU64::new(0),
            watch_traps: AtomicU64::new(0),
        }
    }

    /// Increment a counter by 1.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment a counter by `n`.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Read a counter value.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Snapshot all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            epochs: Self::get(&self.epochs),
            commits: Self::get(&self.commits),
            rollbacks: Self::get(&self.rollbacks),
            forced_commits: Self::get(&self.forced_commits),
            overflow_findings: Self::get(&self.overflow_findings),
            use_after_free_findings: Self::get(&self.use_after_free_findings),
            leaks: Self::get(&self.leaks),
            quarantine_evictions: Self::get(&self.quarantine_evictions),
            invalid_frees: Self::get(&self.invalid_frees),
            watch_traps: Self::get(&self.watch_traps),
        }
    }
}

impl Default for GuardMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of all engine counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub epochs: u64,
    pub commits: u64,
    pub rollbacks: u64,
    pub forced_commits: u64,
    pub overflow_findings: u64,
    pub use_after_free_findings: u64,
    pub leaks: u64,
    pub quarantine_evictions: u64,
    pub invalid_frees: u64,
    pub watch_traps: u64,
}

static GLOBAL_METRICS: GuardMetrics = GuardMetrics::new();

/// Access the global metrics singleton.
#[must_use]
pub fn global_metrics() -> &'static GuardMetrics {
    &GLOBAL_METRICS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let m = GuardMetrics::new();
        let snap = m.snapshot();
        assert_eq!(snap.epochs, 0);
        assert_eq!(snap.rollbacks, 0);
    }

    #[test]
    fn increment_works() {
        let m = GuardMetrics::new();
        GuardMetrics::inc(&m.commits);
        GuardMetrics::inc(&m.commits);
        GuardMetrics::add(&m.quarantine_evictions, 5);
        let snap = m.snapshot();
        assert_eq!(snap.commits, 2);
        assert_eq!(snap.quarantine_evictions, 5);
    }
}
