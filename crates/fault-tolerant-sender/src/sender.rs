//! The fault-tolerant sender.

use crate::codec::{decode_batch, encode_batch};
use crate::config::{FtConfig, Strategy};
use crate::delivery::Delivery;
use crate::stats::{RunningStats, SendStats};
use crate::worker::{QueueWorker, WorkerExit};
use crate::{Batch, FailureKind, FtError, FtResult, SendError, Sink};
use backend_queue::{BackendQueue, DiskQueue, MemoryQueue};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const DISK_QUEUE_SUFFIX: &str = "_local_save";
const MEMORY_QUEUE_SUFFIX: &str = "_memory";

/// Wraps a [`Sink`] so that no batch is lost when the sink fails.
///
/// Owns a primary queue drained by `procs` workers and a backup queue drained
/// by one worker. Every failed attempt, whatever its origin, is retried
/// through the backup queue.
///
/// # Lifecycle
///
/// 1. Create with [`FaultTolerantSender::new()`] inside a Tokio runtime;
///    workers start immediately
/// 2. Call [`send()`](Self::send) from any number of tasks
/// 3. Call [`close()`](Self::close) once to stop the workers, persist queue
///    metadata and close the inner sink
pub struct FaultTolerantSender {
    name: String,
    strategy: Strategy,
    procs: usize,
    primary: Arc<dyn BackendQueue>,
    delivery: Arc<Delivery>,
    workers: Mutex<Option<JoinSet<WorkerExit>>>,
}

impl FaultTolerantSender {
    /// Build both queues from `config` and start the workers.
    ///
    /// # Errors
    ///
    /// - [`FtError::Config`] when the save path is missing for disk queues
    /// - [`FtError::Io`] when the save directory cannot be created
    /// - [`FtError::Queue`] when a queue cannot be opened
    pub fn new(sink: Arc<dyn Sink>, config: FtConfig) -> FtResult<Self> {
        config.validate()?;

        let (primary, backup): (Arc<dyn BackendQueue>, Arc<dyn BackendQueue>) =
            if config.memory_channel {
                (
                    Arc::new(MemoryQueue::new(
                        format!("stream{}", MEMORY_QUEUE_SUFFIX),
                        config.memory_channel_size,
                    )),
                    Arc::new(MemoryQueue::new(
                        format!("backup{}", MEMORY_QUEUE_SUFFIX),
                        config.memory_channel_size,
                    )),
                )
            } else {
                let dir = config
                    .save_log_path
                    .as_ref()
                    .ok_or_else(|| FtError::Config("ft_save_log_path is required".to_string()))?;
                std::fs::create_dir_all(dir)?;

                let options = config.disk_queue_options();
                (
                    Arc::new(DiskQueue::open(
                        format!("stream{}", DISK_QUEUE_SUFFIX),
                        dir,
                        options.clone(),
                    )?),
                    Arc::new(DiskQueue::open(
                        format!("backup{}", DISK_QUEUE_SUFFIX),
                        dir,
                        options,
                    )?),
                )
            };

        Self::with_queues(sink, &config, primary, backup)
    }

    /// Start a sender over caller-supplied queues.
    ///
    /// Only `strategy`, `procs` and `runner_name` are read from `config`.
    pub fn with_queues(
        sink: Arc<dyn Sink>,
        config: &FtConfig,
        primary: Arc<dyn BackendQueue>,
        backup: Arc<dyn BackendQueue>,
    ) -> FtResult<Self> {
        if config.procs == 0 {
            return Err(FtError::Config("ft_procs must be at least 1".to_string()));
        }

        let name = format!("{}(ft)", sink.name());
        let stats = Arc::new(RunningStats::new());
        let delivery = Arc::new(Delivery::new(
            sink,
            backup.clone(),
            stats,
            config.runner_name.clone(),
        ));

        // Primary workers also run in backup_only mode so data left in a
        // persistent primary queue by an earlier always_save run is drained.
        let mut workers = JoinSet::new();
        for worker_id in 0..config.procs {
            workers.spawn(QueueWorker::new(worker_id, primary.clone(), delivery.clone()).run());
        }
        workers.spawn(QueueWorker::new(0, backup, delivery.clone()).run());

        info!(
            runner = %config.runner_name,
            sender = %name,
            strategy = ?config.strategy,
            primary_workers = config.procs,
            "Fault-tolerant sender started"
        );

        Ok(Self {
            name,
            strategy: config.strategy,
            procs: config.procs,
            primary,
            delivery,
            workers: Mutex::new(Some(workers)),
        })
    }

    /// Inner sink name decorated with `(ft)`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Current counters and the error detail of the latest `send`.
    pub fn stats(&self) -> SendStats {
        self.delivery.stats.snapshot()
    }

    /// Deliver or store one batch.
    ///
    /// The returned stats carry an error detail only for records that could
    /// not be delivered or queued. Sink failures whose records were queued
    /// for retry are not reported here.
    pub async fn send(&self, records: Batch) -> SendStats {
        let stats = &self.delivery.stats;
        match self.strategy {
            Strategy::BackupOnly => {
                let attempt = self.delivery.try_send(records, Duration::ZERO).await;
                match &attempt.result {
                    Ok(()) => stats.add_success(),
                    Err(err) => {
                        warn!(
                            runner = %self.delivery.runner_name,
                            sink = %self.delivery.sink.name(),
                            error = %err,
                            "Immediate send failed, records handed to backup queue"
                        );
                        stats.add_error();
                    }
                }

                let lost: Batch = attempt.unqueued.into_iter().flatten().collect();
                let detail = (!lost.is_empty()).then(|| {
                    SendError::new("save data to backend queue error", lost, FailureKind::Default)
                });

                stats.set_lag(self.delivery.backup.depth());
                stats.finish_send(detail)
            }
            Strategy::AlwaysSave => {
                let detail = self.save_to_queue(records).await.err();
                stats.set_lag(self.delivery.backup.depth() + self.primary.depth());
                stats.finish_send(detail)
            }
        }
    }

    async fn save_to_queue(&self, records: Batch) -> Result<(), SendError> {
        let blob = match encode_batch(&records) {
            Ok(blob) => blob,
            Err(err) => {
                return Err(SendError::new(
                    format!("Cannot marshal data: {}", err),
                    records,
                    FailureKind::Default,
                ))
            }
        };

        self.primary.put(blob).await.map_err(|err| {
            SendError::new(
                format!(
                    "{} cannot put data into queue {}: {}",
                    self.delivery.sink.name(),
                    self.primary.name(),
                    err
                ),
                records,
                FailureKind::Default,
            )
        })
    }

    /// Stop all workers, persist queue metadata and close the inner sink.
    ///
    /// Waits for every worker to exit before touching the queues. A worker
    /// blocked inside a sink call delays this until that call returns.
    /// Concurrent callers wait for the first close to finish and then return
    /// `Ok`.
    ///
    /// # Errors
    ///
    /// [`FtError::Abandoned`] carries every record still buffered in a
    /// non-durable queue. Those records are not retried by anyone else.
    pub async fn close(&self) -> FtResult<()> {
        self.delivery.stop();

        let mut workers_slot = self.workers.lock().await;
        let Some(mut workers) = workers_slot.take() else {
            debug!(sender = %self.name, "Sender already closed");
            return Ok(());
        };

        warn!(
            runner = %self.delivery.runner_name,
            sender = %self.name,
            "Waiting for sender workers to exit"
        );

        let mut exited = 0;
        while let Some(joined) = workers.join_next().await {
            exited += 1;
            match joined {
                Ok(exit) => info!(queue = %exit.queue, worker_id = exit.worker_id, "Worker exited"),
                Err(err) => error!(sender = %self.name, error = %err, "Worker task failed"),
            }
        }
        debug_assert_eq!(exited, self.procs + 1);

        warn!(
            runner = %self.delivery.runner_name,
            sender = %self.name,
            exited,
            "Sender workers have completely exited"
        );

        let primary = self.primary.close().await;
        let backup = self.delivery.backup.close().await;
        let abandoned = self.drain_volatile_queues().await;
        let sink = self.delivery.sink.close().await;

        for (queue, result) in [("primary", &primary), ("backup", &backup)] {
            if let Err(err) = result {
                error!(sender = %self.name, queue, error = %err, "Failed to close queue");
            }
        }
        if let Err(err) = &sink {
            error!(sender = %self.name, error = %err, "Failed to close inner sink");
        }

        primary?;
        backup?;
        sink?;

        if abandoned.is_empty() {
            return Ok(());
        }
        error!(
            runner = %self.delivery.runner_name,
            sender = %self.name,
            records = abandoned.len(),
            "Undelivered records left in memory queues"
        );
        Err(FtError::Abandoned(SendError::new(
            format!("{} records left in memory queues at close", abandoned.len()),
            abandoned,
            FailureKind::Default,
        )))
    }

    /// Take back every record still buffered in a closed non-durable queue.
    async fn drain_volatile_queues(&self) -> Batch {
        let mut records = Batch::new();
        for queue in [&self.primary, &self.delivery.backup] {
            if queue.is_durable() {
                continue;
            }
            while let Some(blob) = queue.recv().await {
                match decode_batch(&blob) {
                    Ok(batch) => records.extend(batch),
                    Err(err) => error!(
                        queue = %queue.name(),
                        bytes = blob.len(),
                        error = %err,
                        "Dropping undecodable queue entry"
                    ),
                }
            }
        }
        records
    }
}
