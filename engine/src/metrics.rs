//! Operation counters for the transaction service and notification hub.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ledgerline_common::{ErrorClass, LedgerError};
use serde::Serialize;

/// Engine metrics.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Committed transfers.
    pub transfers: AtomicU64,
    /// Committed exchanges.
    pub exchanges: AtomicU64,
    /// Quotes issued.
    pub quotes_issued: AtomicU64,
    /// Input errors and business rejections.
    pub rejections: AtomicU64,
    /// Repeated client request ids.
    pub duplicates: AtomicU64,
    /// Calls that ran out of retry attempts.
    pub retry_exhausted: AtomicU64,
    /// Timeouts, storage errors and invariant violations.
    pub infrastructure_failures: AtomicU64,
    /// Balance updates queued to a subscriber.
    pub notifications_sent: AtomicU64,
    /// Balance updates dropped on a full subscriber buffer.
    pub notifications_dropped: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transfer_committed(&self) {
        self.transfers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn exchange_committed(&self) {
        self.exchanges.fetch_add(1, Ordering::Relaxed);
    }

    pub fn quote_issued(&self) {
        self.quotes_issued.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed operation under its error class.
    pub fn record_failure(&self, err: &LedgerError) {
        let counter = match (err, err.class()) {
            (LedgerError::RetryLimitExceeded { .. }, _) => &self.retry_exhausted,
            (_, ErrorClass::Input | ErrorClass::Business) => &self.rejections,
            (_, ErrorClass::Duplicate) => &self.duplicates,
            (_, ErrorClass::Transient | ErrorClass::Internal) => &self.infrastructure_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn notifications(&self, sent: u64, dropped: u64) {
        self.notifications_sent.fetch_add(sent, Ordering::Relaxed);
        self.notifications_dropped.fetch_add(dropped, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            transfers: self.transfers.load(Ordering::Relaxed),
            exchanges: self.exchanges.load(Ordering::Relaxed),
            quotes_issued: self.quotes_issued.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            retry_exhausted: self.retry_exhausted.load(Ordering::Relaxed),
            infrastructure_failures: self.infrastructure_failures.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            notifications_dropped: self.notifications_dropped.load(Ordering::Relaxed),
        }
    }

    /// Export counters in Prometheus text format.
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let counters = [
            ("transfers_total", "Committed transfers", snapshot.transfers),
            ("exchanges_total", "Committed exchanges", snapshot.exchanges),
            ("quotes_issued_total", "Exchange quotes issued", snapshot.quotes_issued),
            ("rejections_total", "Rejected requests", snapshot.rejections),
            ("duplicates_total", "Duplicate submissions", snapshot.duplicates),
            ("retry_exhausted_total", "Calls that exhausted retries", snapshot.retry_exhausted),
            (
                "infrastructure_failures_total",
                "Timeouts and storage failures",
                snapshot.infrastructure_failures,
            ),
            ("notifications_sent_total", "Balance updates queued", snapshot.notifications_sent),
            (
                "notifications_dropped_total",
                "Balance updates dropped on full buffers",
                snapshot.notifications_dropped,
            ),
        ];

        let mut out = String::new();
        for (name, help, value) in counters {
            out.push_str(&format!(
                "# HELP ledgerline_{name} {help}\n# TYPE ledgerline_{name} counter\nledgerline_{name} {value}\n"
            ));
        }
        out
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub transfers: u64,
    pub exchanges: u64,
    pub quotes_issued: u64,
    pub rejections: u64,
    pub duplicates: u64,
    pub retry_exhausted: u64,
    pub infrastructure_failures: u64,
    pub notifications_sent: u64,
    pub notifications_dropped: u64,
}

/// Shared metrics instance.
pub type SharedMetrics = Arc<EngineMetrics>;
