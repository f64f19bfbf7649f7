//! Running delivery statistics.

use crate::SendError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the `send` path and every worker.
///
/// Counters only grow. A snapshot may mix values from concurrent updates,
/// which is fine for a gauge.
#[derive(Debug, Default)]
pub struct RunningStats {
    success: AtomicU64,
    errors: AtomicU64,
    lag: AtomicU64,
    last_error: Mutex<Option<SendError>>,
}

impl RunningStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_success(&self) {
        self.success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_lag(&self, lag: u64) {
        self.lag.store(lag, Ordering::Relaxed);
    }

    /// Record the error detail of the latest `send` and return a snapshot
    /// carrying that same detail.
    pub fn finish_send(&self, detail: Option<SendError>) -> SendStats {
        *self.last_error.lock() = detail.clone();
        SendStats {
            error_detail: detail,
            ..self.counters()
        }
    }

    /// Current values, with the error detail of the latest `send`.
    pub fn snapshot(&self) -> SendStats {
        SendStats {
            error_detail: self.last_error.lock().clone(),
            ..self.counters()
        }
    }

    fn counters(&self) -> SendStats {
        SendStats {
            success: self.success.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            lag: self.lag.load(Ordering::Relaxed),
            error_detail: None,
            fault_tolerant: true,
        }
    }
}

/// Result of a fault-tolerant `send`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendStats {
    /// Successful delivery attempts since construction.
    pub success: u64,
    /// Failed delivery attempts since construction.
    pub errors: u64,
    /// Outstanding queued batches.
    pub lag: u64,
    /// Records that could not be stored anywhere. `None` when every record
    /// was either delivered or queued for retry.
    pub error_detail: Option<SendError>,
    /// Set when produced by a fault-tolerant sender.
    pub fault_tolerant: bool,
}

impl SendStats {
    /// True when nothing was lost by this call.
    pub fn is_ok(&self) -> bool {
        self.error_detail.is_none()
    }
}
