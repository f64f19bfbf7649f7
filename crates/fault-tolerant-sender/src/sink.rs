//! Inner sink contract.

use crate::SinkError;
use async_trait::async_trait;

/// One log record: an open JSON object passed through untouched.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// An ordered group of records delivered or rejected together.
pub type Batch = Vec<Record>;

/// Downstream destination wrapped by the fault-tolerant sender.
///
/// Implementors report partial rejection through
/// [`SinkError::Rejected`] so only the failed records are retried. Any other
/// error makes the whole batch eligible for retry.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Sink name, used in log lines and in the decorated sender name.
    fn name(&self) -> &str;

    /// Deliver one batch.
    async fn send(&self, records: &[Record]) -> Result<(), SinkError>;

    /// Release any resources held by the sink.
    async fn close(&self) -> Result<(), SinkError> {
        Ok(())
    }
}
