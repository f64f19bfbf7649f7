//! Single delivery attempts and routing of failures to the backup queue.

use crate::codec::encode_batch;
use crate::retry::split_failure;
use crate::stats::RunningStats;
use crate::{Batch, FtError, Sink};
use backend_queue::BackendQueue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Outcome of one delivery attempt.
pub(crate) struct Attempt {
    /// `Ok` when the sink accepted the batch.
    pub(crate) result: Result<(), FtError>,
    /// Retry units that could not be written to the backup queue.
    pub(crate) unqueued: Vec<Batch>,
}

impl Attempt {
    fn delivered() -> Self {
        Self {
            result: Ok(()),
            unqueued: Vec::new(),
        }
    }

    pub(crate) fn failed(err: FtError) -> Self {
        Self {
            result: Err(err),
            unqueued: Vec::new(),
        }
    }
}

/// State shared by the `send` path and every queue worker.
pub(crate) struct Delivery {
    pub(crate) sink: Arc<dyn Sink>,
    pub(crate) backup: Arc<dyn BackendQueue>,
    pub(crate) stats: Arc<RunningStats>,
    pub(crate) runner_name: String,
    stopped: AtomicBool,
}

impl Delivery {
    pub(crate) fn new(
        sink: Arc<dyn Sink>,
        backup: Arc<dyn BackendQueue>,
        stats: Arc<RunningStats>,
        runner_name: String,
    ) -> Self {
        Self {
            sink,
            backup,
            stats,
            runner_name,
            stopped: AtomicBool::new(false),
        }
    }

    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Deliver `records` once.
    ///
    /// On failure the rejected records are split and written to the backup
    /// queue, then the caller's task sleeps for `fail_sleep`.
    pub(crate) async fn try_send(&self, records: Batch, fail_sleep: Duration) -> Attempt {
        let err = match self.sink.send(&records).await {
            Ok(()) => return Attempt::delivered(),
            Err(err) => err,
        };

        let units = split_failure(&err, records);
        let failed: usize = units.iter().map(Vec::len).sum();
        error!(
            runner = %self.runner_name,
            sink = %self.sink.name(),
            failed_records = failed,
            retry_units = units.len(),
            error = %err,
            "Sink rejected records"
        );
        debug!(runner = %self.runner_name, sink = %self.sink.name(), ?units, "Failed records");

        let unqueued = self.enqueue_backup(units).await;

        if !fail_sleep.is_zero() {
            tokio::time::sleep(fail_sleep).await;
        }

        Attempt {
            result: Err(err.into()),
            unqueued,
        }
    }

    /// Write each unit to the backup queue; returns the units that did not fit.
    pub(crate) async fn enqueue_backup(&self, units: Vec<Batch>) -> Vec<Batch> {
        let mut unqueued = Vec::new();
        for unit in units {
            let written = match encode_batch(&unit) {
                Ok(blob) => self.backup.put(blob).await.map_err(FtError::from),
                Err(err) => Err(FtError::from(err)),
            };

            if let Err(err) = written {
                error!(
                    runner = %self.runner_name,
                    sink = %self.sink.name(),
                    queue = %self.backup.name(),
                    records = unit.len(),
                    error = %err,
                    "Cannot write records back to queue"
                );
                unqueued.push(unit);
            }
        }

        if unqueued.is_empty() {
            info!(
                runner = %self.runner_name,
                queue = %self.backup.name(),
                depth = self.backup.depth(),
                "Failed records queued for retry"
            );
        }
        unqueued
    }
}
