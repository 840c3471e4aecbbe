//! Counters for dispatch and cold-queue activity.

use std::sync::atomic::{AtomicU64, Ordering};

/// Dispatch counters shared by the orchestrator and the classifier.
#[derive(Debug, Default)]
pub struct QueueMetrics {
    dispatched: AtomicU64,
    cold_queued: AtomicU64,
    promoted: AtomicU64,
    refresh_failures: AtomicU64,
}

impl QueueMetrics {
    /// Records inputs handed to the dispatch queue.
    pub fn record_dispatched(&self, count: u64) {
        self.dispatched.fetch_add(count, Ordering::Relaxed);
    }

    /// Records an attempt parked in the cold tier.
    pub fn record_cold_queued(&self) {
        self.cold_queued.fetch_add(1, Ordering::Relaxed);
    }

    /// Records attempts moved from cold to warm.
    pub fn record_promoted(&self, count: u64) {
        self.promoted.fetch_add(count, Ordering::Relaxed);
    }

    /// Records a skipped queue-depth refresh.
    pub fn record_refresh_failure(&self) {
        self.refresh_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Inputs handed to the dispatch queue.
    #[must_use]
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Attempts parked in the cold tier.
    #[must_use]
    pub fn cold_queued(&self) -> u64 {
        self.cold_queued.load(Ordering::Relaxed)
    }

    /// Attempts moved from cold to warm.
    #[must_use]
    pub fn promoted(&self) -> u64 {
        self.promoted.load(Ordering::Relaxed)
    }

    /// Skipped queue-depth refreshes.
    #[must_use]
    pub fn refresh_failures(&self) -> u64 {
        self.refresh_failures.load(Ordering::Relaxed)
    }

    /// Converts metrics to a dictionary.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::json!({
            "dispatched": self.dispatched(),
            "cold_queued": self.cold_queued(),
            "promoted": self.promoted(),
            "refresh_failures": self.refresh_failures(),
        })
    }
}
