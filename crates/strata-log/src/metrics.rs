//! Lock-free per-subscription delivery metrics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-subscription counters using atomics (no locks on the data path).
#[derive(Debug, Default)]
pub struct SubscriptionMetrics {
    /// Records delivered to the subscriber.
    pub records: AtomicU64,
    /// Read batches issued against the log.
    pub reads: AtomicU64,
    /// Read errors that were logged and retried.
    pub read_errors: AtomicU64,
}

impl SubscriptionMetrics {
    pub(crate) fn record_delivery(&self) {
        self.records.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_read_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of the current counters.
    #[must_use]
    pub fn snapshot(&self) -> SubscriptionMetricsSnapshot {
        SubscriptionMetricsSnapshot {
            records: self.records.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of subscription metrics.
#[derive(Debug, Clone, Copy)]
pub struct SubscriptionMetricsSnapshot {
    /// Records delivered.
    pub records: u64,
    /// Read batches issued.
    pub reads: u64,
    /// Read errors retried.
    pub read_errors: u64,
}
