//! Read NDJSON input, batch it and hand batches to the sender.

use fault_tolerant_sender::{Batch, FaultTolerantSender, FtError, FtResult, Record};
use std::future::Future;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, error, info, warn};

/// Counts for one shipping run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShipSummary {
    pub lines: u64,
    pub skipped: u64,
    pub batches: u64,
    /// Records reported back by the sender as neither delivered nor queued.
    pub lost: u64,
}

/// Parse one input line. Blank lines yield `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<Record>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    match serde_json::from_str::<serde_json::Value>(line) {
        Ok(serde_json::Value::Object(record)) => Ok(Some(record)),
        Ok(other) => Err(format!("expected a JSON object, got {}", kind_of(&other))),
        Err(err) => Err(err.to_string()),
    }
}

fn kind_of(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

/// Ship lines from `input` until EOF or until `shutdown` resolves.
///
/// A partial batch is flushed in both cases. The sender is not closed here.
pub async fn ship<R, F>(
    input: R,
    sender: &FaultTolerantSender,
    batch_size: usize,
    shutdown: F,
) -> std::io::Result<ShipSummary>
where
    R: AsyncBufRead + Unpin,
    F: Future<Output = ()>,
{
    let batch_size = batch_size.max(1);
    let mut lines = input.lines();
    let mut summary = ShipSummary::default();
    let mut batch: Batch = Vec::with_capacity(batch_size);

    tokio::pin!(shutdown);

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = &mut shutdown => {
                info!("Shutdown requested, flushing pending records");
                break;
            }
        };
        let Some(line) = line else {
            debug!("End of input");
            break;
        };

        summary.lines += 1;
        match parse_line(&line) {
            Ok(Some(record)) => batch.push(record),
            Ok(None) => {}
            Err(err) => {
                warn!(line = summary.lines, error = %err, "Skipping invalid input line");
                summary.skipped += 1;
            }
        }

        if batch.len() >= batch_size {
            flush(sender, &mut batch, &mut summary).await;
        }
    }

    if !batch.is_empty() {
        flush(sender, &mut batch, &mut summary).await;
    }
    Ok(summary)
}

async fn flush(sender: &FaultTolerantSender, batch: &mut Batch, summary: &mut ShipSummary) {
    let records = std::mem::take(batch);
    let count = records.len();
    let stats = sender.send(records).await;
    summary.batches += 1;

    if let Some(detail) = stats.error_detail {
        error!(
            sender = %sender.name(),
            records = count,
            lost = detail.failed.len(),
            error = %detail,
            "Records could not be delivered or stored"
        );
        summary.lost += detail.failed.len() as u64;
    } else {
        debug!(sender = %sender.name(), records = count, lag = stats.lag, "Batch handed off");
    }
}

/// Close the sender; records it hands back from memory queues count as lost.
pub async fn close_sender(sender: &FaultTolerantSender, summary: &mut ShipSummary) -> FtResult<()> {
    match sender.close().await {
        Err(FtError::Abandoned(err)) => {
            error!(
                sender = %sender.name(),
                lost = err.failed.len(),
                "Undelivered records dropped at shutdown"
            );
            summary.lost += err.failed.len() as u64;
            Ok(())
        }
        other => other,
    }
}
