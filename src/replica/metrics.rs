// Lease change counters, fed from triggers

use crate::leases::LeaseTrigger;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct LeaseMetrics {
    transfer_success: AtomicU64,
    transfer_error: AtomicU64,
    request_success: AtomicU64,
    request_error: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseMetricsSnapshot {
    pub transfer_success: u64,
    pub transfer_error: u64,
    pub request_success: u64,
    pub request_error: u64,
}

impl LeaseMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a finished lease change. A trigger that is neither failed nor
    /// followed by a commit must not be recorded.
    pub fn record(&self, trigger: LeaseTrigger) {
        let counter = match (trigger.is_transfer, trigger.failed) {
            (true, false) => &self.transfer_success,
            (true, true) => &self.transfer_error,
            (false, false) => &self.request_success,
            (false, true) => &self.request_error,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LeaseMetricsSnapshot {
        LeaseMetricsSnapshot {
            transfer_success: self.transfer_success.load(Ordering::Relaxed),
            transfer_error: self.transfer_error.load(Ordering::Relaxed),
            request_success: self.request_success.load(Ordering::Relaxed),
            request_error: self.request_error.load(Ordering::Relaxed),
        }
    }
}
