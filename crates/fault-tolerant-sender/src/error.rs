//! Error types for the fault-tolerant sender.

use crate::Record;
use std::fmt;
use thiserror::Error;

/// How a sink classified a rejected batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureKind {
    /// Plain failure; the failed records are retried as one unit.
    #[default]
    Default,
    /// The unit was too large or malformed to accept at once and must be
    /// split before it is retried.
    BinaryUnpack,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::BinaryUnpack => write!(f, "binary_unpack"),
        }
    }
}

/// A failure that names exactly which records were not delivered.
///
/// Sinks return it to report partial or total rejection. The sender returns
/// it to its own caller only for records it could not store anywhere.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message} (kind: {kind}, failed records: {})", .failed.len())]
pub struct SendError {
    /// Human-readable cause.
    pub message: String,
    /// The records that were not accepted.
    pub failed: Vec<Record>,
    /// Sink-reported classification.
    pub kind: FailureKind,
}

impl SendError {
    /// Create a new send error.
    pub fn new(message: impl Into<String>, failed: Vec<Record>, kind: FailureKind) -> Self {
        Self {
            message: message.into(),
            failed,
            kind,
        }
    }
}

/// Error returned by an inner [`Sink`](crate::Sink).
#[derive(Debug, Error)]
pub enum SinkError {
    /// Structured rejection carrying the failed subset.
    #[error(transparent)]
    Rejected(#[from] SendError),

    /// Any other failure; the whole batch is treated as failed.
    #[error("Sink error: {0}")]
    Unclassified(String),
}

/// Fault-tolerant sender error type.
#[derive(Error, Debug)]
pub enum FtError {
    /// Missing or invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error while preparing queue storage
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Queue error
    #[error("Queue error: {0}")]
    Queue(#[from] backend_queue::QueueError),

    /// Batch encoding or decoding error
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Inner sink error
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    /// Records still held by non-durable queues when the sender closed
    #[error("Records abandoned at close: {0}")]
    Abandoned(SendError),
}

/// Result type alias using FtError.
pub type FtResult<T> = Result<T, FtError>;
