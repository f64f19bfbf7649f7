//! Queue-drain worker loop.
//!
//! ```text
//! Idle ──▶ Draining-pending ⇄ Waiting-on-queue ──▶ Retrying
//!   ▲                                                  │
//!   └──── success ◀──┴──▶ failure ─▶ backoff sleep ────┘
//!
//! Stopping is checked at the top of every iteration ──▶ Exited
//! ```

use crate::codec::decode_batch;
use crate::delivery::{Attempt, Delivery};
use crate::retry::Backoff;
use crate::Batch;
use backend_queue::BackendQueue;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error};

/// How long a worker waits on an empty queue before re-checking the stop flag.
pub(crate) const IDLE_TICK: Duration = Duration::from_secs(1);

/// Exit acknowledgement returned when a worker observes the stop flag.
#[derive(Debug, Clone)]
pub(crate) struct WorkerExit {
    pub(crate) queue: String,
    pub(crate) worker_id: usize,
}

/// Drains one queue and retries failures through the backup queue.
pub(crate) struct QueueWorker {
    worker_id: usize,
    queue: Arc<dyn BackendQueue>,
    delivery: Arc<Delivery>,
}

impl QueueWorker {
    pub(crate) fn new(
        worker_id: usize,
        queue: Arc<dyn BackendQueue>,
        delivery: Arc<Delivery>,
    ) -> Self {
        Self {
            worker_id,
            queue,
            delivery,
        }
    }

    /// Run until the stop flag is set.
    ///
    /// Batches whose retry units could not be queued are kept in memory and
    /// retried on the next pass, after the current pass has finished.
    pub(crate) async fn run(self) -> WorkerExit {
        let mut ticker = interval_at(Instant::now() + IDLE_TICK, IDLE_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut backoff = Backoff::new();
        let mut pending: Vec<Batch> = Vec::new();
        let mut overflow: Vec<Batch> = Vec::new();
        let mut cursor = 0;

        debug!(
            runner = %self.delivery.runner_name,
            queue = %self.queue.name(),
            worker_id = self.worker_id,
            "Queue worker started"
        );

        loop {
            if self.delivery.is_stopped() {
                debug!(
                    runner = %self.delivery.runner_name,
                    queue = %self.queue.name(),
                    worker_id = self.worker_id,
                    held_batches = pending.len() - cursor + overflow.len(),
                    "Queue worker exiting"
                );
                return WorkerExit {
                    queue: self.queue.name().to_string(),
                    worker_id: self.worker_id,
                };
            }

            let attempt = if cursor < pending.len() {
                let records = std::mem::take(&mut pending[cursor]);
                cursor += 1;
                self.delivery.try_send(records, backoff.current()).await
            } else {
                tokio::select! {
                    blob = self.queue.recv() => match blob {
                        Some(blob) => self.send_blob(&blob, backoff.current()).await,
                        None => {
                            // Closed queue: idle until stopped.
                            tokio::time::sleep(IDLE_TICK).await;
                            continue;
                        }
                    },
                    _ = ticker.tick() => continue,
                }
            };

            match &attempt.result {
                Ok(()) => {
                    backoff.on_success();
                    self.delivery.stats.add_success();
                }
                Err(err) => {
                    error!(
                        runner = %self.delivery.runner_name,
                        sink = %self.delivery.sink.name(),
                        queue = %self.queue.name(),
                        backoff_secs = backoff.current().as_secs(),
                        error = %err,
                        "Cannot send records from queue"
                    );
                    self.delivery.stats.add_error();
                    backoff.on_failure();
                }
            }

            overflow.extend(attempt.unqueued);
            if cursor == pending.len() {
                pending = std::mem::take(&mut overflow);
                cursor = 0;
            }
        }
    }

    async fn send_blob(&self, blob: &[u8], fail_sleep: Duration) -> Attempt {
        match decode_batch(blob) {
            Ok(records) => self.delivery.try_send(records, fail_sleep).await,
            Err(err) => {
                error!(
                    runner = %self.delivery.runner_name,
                    queue = %self.queue.name(),
                    bytes = blob.len(),
                    error = %err,
                    "Dropping undecodable queue entry"
                );
                Attempt::failed(err.into())
            }
        }
    }
}
