//! # Fault-Tolerant Sender
//!
//! Delivery layer between a producer of record batches and a downstream
//! [`Sink`] that can fail transiently. No batch is silently lost: failed
//! records are written to a local queue and retried in the background until
//! the sink accepts them.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────────────┐
//!  send(batch) ──▶│ FaultTolerantSender  │
//!                 └──┬────────────────┬──┘
//!      always_save   │                │  backup_only
//!                    ▼                ▼
//!           ┌────────────────┐   ┌──────────┐  failure   ┌──────────────┐
//!           │ Primary queue  │   │   Sink   │───────────▶│ Backup queue │
//!           │ (N workers)    │   └──────────┘            │ (1 worker)   │
//!           └───────┬────────┘        ▲                  └──────┬───────┘
//!                   │ deliver         │ deliver                 │
//!                   └────────────────▶┴◀────────────────────────┘
//!                        any failure is split and written to the backup queue
//! ```
//!
//! ## Strategies
//!
//! - **`backup_only`**: `send` calls the sink directly. Failed records go to
//!   the backup queue; only records that cannot be queued are reported back.
//! - **`always_save`**: `send` only writes to the primary queue. Primary
//!   workers do all delivery.
//!
//! ## Retry policy
//!
//! - Unclassified sink errors retry the whole batch; structured rejections
//!   retry only the failed records.
//! - `BinaryUnpack` rejections are halved before they are queued.
//! - Each worker sleeps 1s, 2s, ... up to 10s after consecutive failures and
//!   resets to 1s after a success.
//!
//! ## Example
//!
//! ```ignore
//! use fault_tolerant_sender::{FaultTolerantSender, FtConfig, Strategy};
//!
//! let config = FtConfig {
//!     strategy: Strategy::BackupOnly,
//!     save_log_path: Some("/var/lib/shipper/ft".into()),
//!     ..Default::default()
//! };
//! let sender = FaultTolerantSender::new(sink, config)?;
//!
//! let stats = sender.send(records).await;
//! if let Some(lost) = stats.error_detail {
//!     tracing::error!(records = lost.failed.len(), "records could not be stored");
//! }
//!
//! sender.close().await?;
//! ```

pub mod codec;
mod config;
mod delivery;
mod error;
pub mod retry;
mod sender;
mod sink;
mod stats;
mod worker;

pub use config::{
    FtConfig, Strategy, DEFAULT_MEMORY_CHANNEL_SIZE, DEFAULT_PROCS, DEFAULT_SYNC_EVERY,
    DEFAULT_WRITE_LIMIT_MB, MB, UNDEFINED_RUNNER_NAME,
};
pub use error::{FailureKind, FtError, FtResult, SendError, SinkError};
pub use sender::FaultTolerantSender;
pub use sink::{Batch, Record, Sink};
pub use stats::{RunningStats, SendStats};

pub use backend_queue::{BackendQueue, DiskQueue, MemoryQueue, QueueError};
