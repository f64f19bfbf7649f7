//! Queue error types.

use thiserror::Error;

/// Queue error type.
#[derive(Error, Debug)]
pub enum QueueError {
    /// IO error from the backing files
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The in-memory buffer has no room left
    #[error("Queue {name} is full (capacity {capacity})")]
    Full { name: String, capacity: usize },

    /// The queue was closed and accepts no more writes
    #[error("Queue {0} is closed")]
    Closed(String),

    /// Message does not fit the configured size bounds
    #[error("Invalid message size {size} for queue {name} (max {max})")]
    MessageSize { name: String, size: usize, max: usize },

    /// Metadata or segment data could not be parsed
    #[error("Corrupt queue data: {0}")]
    Corrupt(String),
}

/// Result type alias using QueueError.
pub type QueueResult<T> = Result<T, QueueError>;
