//! JSON-lines sink: one serialized record per line.

use async_trait::async_trait;
use fault_tolerant_sender::{Record, Sink, SinkError};
use std::path::Path;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

type Output = Box<dyn AsyncWrite + Send + Unpin>;

/// Writes each accepted batch as JSON lines to a file or stdout.
pub struct JsonLinesSink {
    name: String,
    out: Mutex<Output>,
}

impl JsonLinesSink {
    pub fn new(name: impl Into<String>, out: Output) -> Self {
        Self {
            name: name.into(),
            out: Mutex::new(out),
        }
    }

    pub fn stdout() -> Self {
        Self::new("stdout", Box::new(tokio::io::stdout()))
    }

    /// Append to `path`, creating it if needed.
    pub async fn append_to(path: &Path) -> std::io::Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self::new(
            format!("file:{}", path.display()),
            Box::new(file),
        ))
    }
}

#[async_trait]
impl Sink for JsonLinesSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, records: &[Record]) -> Result<(), SinkError> {
        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record)
                .map_err(|e| SinkError::Unclassified(format!("encode record: {}", e)))?;
            buf.push(b'\n');
        }

        let mut out = self.out.lock().await;
        out.write_all(&buf)
            .await
            .map_err(|e| SinkError::Unclassified(format!("write {}: {}", self.name, e)))?;
        out.flush()
            .await
            .map_err(|e| SinkError::Unclassified(format!("flush {}: {}", self.name, e)))
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.out
            .lock()
            .await
            .shutdown()
            .await
            .map_err(|e| SinkError::Unclassified(format!("close {}: {}", self.name, e)))
    }
}
