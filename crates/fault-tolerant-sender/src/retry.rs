//! Retry policy: per-worker backoff and failure splitting.

use crate::{Batch, FailureKind, SinkError};
use std::time::Duration;

/// Backoff after the first failure, in seconds.
pub const INITIAL_BACKOFF_SECS: u64 = 1;

/// Backoff never grows past this many seconds.
pub const MAX_BACKOFF_SECS: u64 = 10;

/// Linear backoff owned by a single worker.
///
/// Grows by one second per consecutive failure up to
/// [`MAX_BACKOFF_SECS`] and drops back to [`INITIAL_BACKOFF_SECS`] on the
/// first success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    secs: u64,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            secs: INITIAL_BACKOFF_SECS,
        }
    }

    /// Sleep to apply if the next attempt fails.
    pub fn current(&self) -> Duration {
        Duration::from_secs(self.secs)
    }

    pub fn on_success(&mut self) {
        self.secs = INITIAL_BACKOFF_SECS;
    }

    pub fn on_failure(&mut self) {
        self.secs = (self.secs + 1).min(MAX_BACKOFF_SECS);
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Turn a failed delivery into the units to retry.
///
/// - Unclassified errors retry the whole attempted batch.
/// - Structured rejections retry exactly the reported records.
/// - `BinaryUnpack` rejections are halved into two units, first half first.
///   A single record cannot be halved and is retried as is.
///
/// Empty units are dropped.
pub fn split_failure(err: &SinkError, attempted: Batch) -> Vec<Batch> {
    let (mut failed, kind) = match err {
        SinkError::Unclassified(_) => (attempted, FailureKind::Default),
        SinkError::Rejected(send_err) => (send_err.failed.clone(), send_err.kind),
    };

    if failed.is_empty() {
        return Vec::new();
    }

    if kind == FailureKind::BinaryUnpack {
        let half = failed.len() / 2;
        if half > 0 {
            let second = failed.split_off(half);
            return vec![failed, second];
        }
    }
    vec![failed]
}
