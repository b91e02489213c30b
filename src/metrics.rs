//! Transaction state gauges

use crate::TransactionStatus;
use std::sync::atomic::{AtomicI64, Ordering};

/// Fire-and-forget gauge sink.
///
/// Transitions call the pair: add to the new state's gauge, decrement the
/// prior state's gauge.
pub trait MetricsCounter: Send + Sync + 'static {
    /// A transaction was created or replayed
    fn add_total_transactions(&self);
    /// A transaction entered `IN_PROGRESS`
    fn add_in_progress_transactions(&self);
    /// A transaction committed
    fn add_success_transactions(&self);
    /// A transaction failed
    fn add_failed_transactions(&self);
    /// A transaction was canceled
    fn add_canceled_transactions(&self);
    /// Counterpart of `add_total_transactions`
    fn decrement_total_transactions(&self);
    /// A transaction left `IN_PROGRESS`
    fn decrement_in_progress_transactions(&self);
    /// A transaction left `SUCCESS`
    fn decrement_success_transactions(&self);
    /// A transaction left `FAILED`
    fn decrement_failed_transactions(&self);
    /// A transaction left `CANCELED`
    fn decrement_canceled_transactions(&self);
}

/// Record a transition as an add/decrement pair
pub(crate) fn record_transition(
    metrics: &dyn MetricsCounter,
    from: TransactionStatus,
    to: TransactionStatus,
) {
    match to {
        TransactionStatus::InProgress => metrics.add_in_progress_transactions(),
        TransactionStatus::Success => metrics.add_success_transactions(),
        TransactionStatus::Failed => metrics.add_failed_transactions(),
        TransactionStatus::Canceled => metrics.add_canceled_transactions(),
    }
    match from {
        TransactionStatus::InProgress => metrics.decrement_in_progress_transactions(),
        TransactionStatus::Success => metrics.decrement_success_transactions(),
        TransactionStatus::Failed => metrics.decrement_failed_transactions(),
        TransactionStatus::Canceled => metrics.decrement_canceled_transactions(),
    }
}

/// No-op metrics
pub struct NoOpMetrics;

impl MetricsCounter for NoOpMetrics {
    fn add_total_transactions(&self) {}
    fn add_in_progress_transactions(&self) {}
    fn add_success_transactions(&self) {}
    fn add_failed_transactions(&self) {}
    fn add_canceled_transactions(&self) {}
    fn decrement_total_transactions(&self) {}
    fn decrement_in_progress_transactions(&self) {}
    fn decrement_success_transactions(&self) {}
    fn decrement_failed_transactions(&self) {}
    fn decrement_canceled_transactions(&self) {}
}

/// In-process gauges
pub struct TransactionStats {
    pub total: AtomicI64,
    pub in_progress: AtomicI64,
    pub success: AtomicI64,
    pub failed: AtomicI64,
    pub canceled: AtomicI64,
}

impl TransactionStats {
    pub fn new() -> Self {
        Self {
            total: AtomicI64::new(0),
            in_progress: AtomicI64::new(0),
            success: AtomicI64::new(0),
            failed: AtomicI64::new(0),
            canceled: AtomicI64::new(0),
        }
    }

    pub fn snapshot(&self) -> TransactionStatsSnapshot {
        TransactionStatsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            in_progress: self.in_progress.load(Ordering::Relaxed),
            success: self.success.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            canceled: self.canceled.load(Ordering::Relaxed),
        }
    }
}

impl Default for TransactionStats {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCounter for TransactionStats {
    fn add_total_transactions(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }
    fn add_in_progress_transactions(&self) {
        self.in_progress.fetch_add(1, Ordering::Relaxed);
    }
    fn add_success_transactions(&self) {
        self.success.fetch_add(1, Ordering::Relaxed);
    }
    fn add_failed_transactions(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }
    fn add_canceled_transactions(&self) {
        self.canceled.fetch_add(1, Ordering::Relaxed);
    }
    fn decrement_total_transactions(&self) {
        self.total.fetch_sub(1, Ordering::Relaxed);
    }
    fn decrement_in_progress_transactions(&self) {
        self.in_progress.fetch_sub(1, Ordering::Relaxed);
    }
    fn decrement_success_transactions(&self) {
        self.success.fetch_sub(1, Ordering::Relaxed);
    }
    fn decrement_failed_transactions(&self) {
        self.failed.fetch_sub(1, Ordering::Relaxed);
    }
    fn decrement_canceled_transactions(&self) {
        self.canceled.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransactionStatsSnapshot {
    pub total: i64,
    pub in_progress: i64,
    pub success: i64,
    pub failed: i64,
    pub canceled: i64,
}
