//! Memory-bounded queue.

use crate::{BackendQueue, QueueError, QueueResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, warn};

/// In-process queue holding at most `capacity` blobs.
///
/// Writes never block: a full buffer is reported as [`QueueError::Full`] so
/// the caller can decide what to do with the data. Nothing survives a
/// restart.
pub struct MemoryQueue {
    name: String,
    capacity: usize,
    sender: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    receiver: AsyncMutex<mpsc::Receiver<Vec<u8>>>,
    depth: AtomicU64,
}

impl MemoryQueue {
    /// Create a queue buffering up to `capacity` blobs (at least one).
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            name: name.into(),
            capacity,
            sender: Mutex::new(Some(sender)),
            receiver: AsyncMutex::new(receiver),
            depth: AtomicU64::new(0),
        }
    }

    /// Maximum number of buffered blobs.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[async_trait]
impl BackendQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, blob: Vec<u8>) -> QueueResult<()> {
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            return Err(QueueError::Closed(self.name.clone()));
        };

        // Count before sending so a fast reader never decrements below zero.
        self.depth.fetch_add(1, Ordering::SeqCst);
        match sender.try_send(blob) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.depth.fetch_sub(1, Ordering::SeqCst);
                match err {
                    mpsc::error::TrySendError::Full(_) => Err(QueueError::Full {
                        name: self.name.clone(),
                        capacity: self.capacity,
                    }),
                    mpsc::error::TrySendError::Closed(_) => {
                        Err(QueueError::Closed(self.name.clone()))
                    }
                }
            }
        }
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        let mut receiver = self.receiver.lock().await;
        let blob = receiver.recv().await?;
        self.depth.fetch_sub(1, Ordering::SeqCst);
        Some(blob)
    }

    fn depth(&self) -> u64 {
        self.depth.load(Ordering::SeqCst)
    }

    fn is_durable(&self) -> bool {
        false
    }

    async fn close(&self) -> QueueResult<()> {
        if self.sender.lock().take().is_none() {
            return Ok(());
        }

        let depth = self.depth();
        if depth > 0 {
            warn!(
                queue = %self.name,
                depth,
                "Memory queue closed with undelivered blobs; they are lost unless drained"
            );
        } else {
            debug!(queue = %self.name, "Memory queue closed");
        }
        Ok(())
    }
}
