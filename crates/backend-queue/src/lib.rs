//! FIFO byte-blob queues used by the fault-tolerant sender.
//!
//! This crate provides:
//! - [`BackendQueue`]: the queue contract (put / recv / depth / close)
//! - [`MemoryQueue`]: a capacity-bounded in-process queue
//! - [`DiskQueue`]: an append-only segment queue with periodic metadata sync
//!
//! Every queue is safe to share between many producers and many consumers.

mod disk;
mod error;
mod memory;

pub use disk::{DiskQueue, DiskQueueOptions, DEFAULT_SYNC_TIMEOUT, MAX_BYTES_PER_FILE};
pub use error::{QueueError, QueueResult};
pub use memory::MemoryQueue;

use async_trait::async_trait;

/// A durable or memory-bounded FIFO of opaque byte blobs.
///
/// Blobs are handed out in insertion order. Disk-backed implementations
/// deliver at-least-once across process restarts: anything read after the
/// last metadata sync is read again after a crash.
#[async_trait]
pub trait BackendQueue: Send + Sync {
    /// Queue name, used in file names and log lines.
    fn name(&self) -> &str;

    /// Append a blob to the tail of the queue.
    async fn put(&self, blob: Vec<u8>) -> QueueResult<()>;

    /// Wait for the next blob.
    ///
    /// Cancel-safe: dropping the future before it resolves never loses a
    /// blob. Returns `None` once the queue has been closed.
    async fn recv(&self) -> Option<Vec<u8>>;

    /// Number of blobs stored and not yet handed out.
    fn depth(&self) -> u64;

    /// Whether stored blobs outlive the queue instance.
    ///
    /// Blobs left in a non-durable queue can still be drained with `recv`
    /// after `close`, and are gone once the queue is dropped.
    fn is_durable(&self) -> bool {
        true
    }

    /// Close the queue, persisting any metadata. Calling it twice is a no-op.
    async fn close(&self) -> QueueResult<()>;
}
