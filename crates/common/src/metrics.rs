//! Application-level counters.
//!
//! Lightweight atomics for watching the federation pipelines from logs and
//! debuggers. Counters are process-wide and monotonic; readers take a
//! snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Global metrics instance.
static METRICS: std::sync::OnceLock<Arc<Metrics>> = std::sync::OnceLock::new();

/// Get the global metrics instance.
pub fn get_metrics() -> &'static Arc<Metrics> {
    METRICS.get_or_init(|| Arc::new(Metrics::new()))
}

/// Application metrics collector.
#[derive(Debug)]
pub struct Metrics {
    // === Inbound ===
    /// Activities accepted into an inbox.
    pub activities_received: AtomicU64,
    /// Payloads dropped by the prefilter.
    pub activities_prefiltered: AtomicU64,
    /// Payloads written to the quarantine bucket.
    pub activities_quarantined: AtomicU64,

    // === Outbound ===
    /// Deliveries that reached a remote inbox.
    pub deliveries_succeeded: AtomicU64,
    /// Deliveries that failed permanently.
    pub deliveries_failed: AtomicU64,
    /// Deliveries deferred as transient.
    pub deliveries_transient: AtomicU64,
    /// Recipients skipped because they were gone.
    pub recipients_gone: AtomicU64,

    // === Statistics maintenance ===
    /// Counter-update batches flushed.
    pub counter_batches_flushed: AtomicU64,
    /// Counter-update statements that failed.
    pub counter_statements_failed: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub activities_received: u64,
    pub activities_prefiltered: u64,
    pub activities_quarantined: u64,
    pub deliveries_succeeded: u64,
    pub deliveries_failed: u64,
    pub deliveries_transient: u64,
    pub recipients_gone: u64,
    pub counter_batches_flushed: u64,
    pub counter_statements_failed: u64,
}

impl Metrics {
    /// Create a new metrics instance with all counters at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            activities_received: AtomicU64::new(0),
            activities_prefiltered: AtomicU64::new(0),
            activities_quarantined: AtomicU64::new(0),
            deliveries_succeeded: AtomicU64::new(0),
            deliveries_failed: AtomicU64::new(0),
            deliveries_transient: AtomicU64::new(0),
            recipients_gone: AtomicU64::new(0),
            counter_batches_flushed: AtomicU64::new(0),
            counter_statements_failed: AtomicU64::new(0),
        }
    }

    /// Increment a counter by one.
    pub fn increment(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a point-in-time snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            activities_received: self.activities_received.load(Ordering::Relaxed),
            activities_prefiltered: self.activities_prefiltered.load(Ordering::Relaxed),
            activities_quarantined: self.activities_quarantined.load(Ordering::Relaxed),
            deliveries_succeeded: self.deliveries_succeeded.load(Ordering::Relaxed),
            deliveries_failed: self.deliveries_failed.load(Ordering::Relaxed),
            deliveries_transient: self.deliveries_transient.load(Ordering::Relaxed),
            recipients_gone: self.recipients_gone.load(Ordering::Relaxed),
            counter_batches_flushed: self.counter_batches_flushed.load(Ordering::Relaxed),
            counter_statements_failed: self.counter_statements_failed.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
