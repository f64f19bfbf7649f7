use async_trait::async_trait;
use backend_queue::{BackendQueue, DiskQueue, DiskQueueOptions, MemoryQueue, QueueError, QueueResult};
use fault_tolerant_sender::codec::{decode_batch, encode_batch};
use fault_tolerant_sender::{
    Batch, FailureKind, FaultTolerantSender, FtConfig, FtError, FtResult, Record, SendError, Sink,
    SinkError, Strategy,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

// =========================================================================
// Test doubles
// =========================================================================

type Behavior = Box<dyn Fn(&[Record], usize) -> Result<(), SinkError> + Send + Sync>;

/// Sink whose answer is decided per call by a closure.
struct ScriptedSink {
    behavior: Behavior,
    calls: Mutex<Vec<(Instant, Batch)>>,
    accepted: Mutex<Vec<Batch>>,
    closed: AtomicBool,
}

impl ScriptedSink {
    fn new(behavior: impl Fn(&[Record], usize) -> Result<(), SinkError> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            behavior: Box::new(behavior),
            calls: Mutex::new(Vec::new()),
            accepted: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    fn accepted_records(&self) -> Vec<Record> {
        self.accepted.lock().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl Sink for ScriptedSink {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn send(&self, records: &[Record]) -> Result<(), SinkError> {
        let call = {
            let mut calls = self.calls.lock();
            calls.push((Instant::now(), records.to_vec()));
            calls.len()
        };
        let result = (self.behavior)(records, call);
        if result.is_ok() {
            self.accepted.lock().push(records.to_vec());
        }
        result
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Memory queue that remembers every blob written to it.
struct RecordingQueue {
    inner: MemoryQueue,
    puts: Mutex<Vec<Vec<u8>>>,
    fail_puts: AtomicBool,
}

impl RecordingQueue {
    fn new(name: &str, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryQueue::new(name, capacity),
            puts: Mutex::new(Vec::new()),
            fail_puts: AtomicBool::new(false),
        })
    }

    fn put_batches(&self) -> Vec<Batch> {
        self.puts
            .lock()
            .iter()
            .map(|blob| decode_batch(blob).unwrap())
            .collect()
    }
}

#[async_trait]
impl BackendQueue for RecordingQueue {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn put(&self, blob: Vec<u8>) -> QueueResult<()> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(QueueError::Closed(self.name().to_string()));
        }
        self.puts.lock().push(blob.clone());
        self.inner.put(blob).await
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        self.inner.recv().await
    }

    fn depth(&self) -> u64 {
        self.inner.depth()
    }

    fn is_durable(&self) -> bool {
        self.inner.is_durable()
    }

    async fn close(&self) -> QueueResult<()> {
        self.inner.close().await
    }
}

fn batch(value: Value) -> Batch {
    value
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_object().cloned().unwrap())
        .collect()
}

fn record_keys(records: &[Record]) -> BTreeSet<String> {
    records
        .iter()
        .map(|r| serde_json::to_string(r).unwrap())
        .collect()
}

fn config(strategy: Strategy) -> FtConfig {
    FtConfig {
        strategy,
        memory_channel: true,
        runner_name: "test-runner".to_string(),
        ..Default::default()
    }
}

fn start(
    sink: Arc<ScriptedSink>,
    strategy: Strategy,
) -> (FaultTolerantSender, Arc<RecordingQueue>, Arc<RecordingQueue>) {
    let primary = RecordingQueue::new("stream_memory", 100);
    let backup = RecordingQueue::new("backup_memory", 100);
    let sender = FaultTolerantSender::with_queues(
        sink,
        &config(strategy),
        primary.clone(),
        backup.clone(),
    )
    .unwrap();
    (sender, primary, backup)
}

/// Records handed back by a close that left data in memory queues.
fn abandoned(result: FtResult<()>) -> Batch {
    match result {
        Err(FtError::Abandoned(err)) => err.failed,
        other => panic!("expected abandoned records, got {:?}", other),
    }
}

/// Let workers run (virtual time) until `done` holds.
async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..2_000 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("condition not reached");
}

// =========================================================================
// Construction
// =========================================================================

#[tokio::test]
async fn test_name_is_decorated() {
    let sink = ScriptedSink::new(|_, _| Ok(()));
    let sender = FaultTolerantSender::new(sink, config(Strategy::AlwaysSave)).unwrap();
    assert_eq!(sender.name(), "scripted(ft)");
    assert_eq!(sender.strategy(), Strategy::AlwaysSave);
    sender.close().await.unwrap();
}

#[tokio::test]
async fn test_disk_backing_requires_save_path() {
    let sink = ScriptedSink::new(|_, _| Ok(()));
    let result = FaultTolerantSender::new(sink, FtConfig::default());
    assert!(matches!(result, Err(FtError::Config(_))));
}

#[tokio::test]
async fn test_uncreatable_save_path_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("not-a-dir");
    std::fs::write(&file, "x").unwrap();

    let sink = ScriptedSink::new(|_, _| Ok(()));
    let result = FaultTolerantSender::new(
        sink,
        FtConfig {
            save_log_path: Some(file),
            ..Default::default()
        },
    );
    assert!(matches!(result, Err(FtError::Io(_))));
}

#[tokio::test]
async fn test_disk_backing_creates_queue_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ft");

    let sink = ScriptedSink::new(|_, _| Ok(()));
    let sender = FaultTolerantSender::new(
        sink,
        FtConfig {
            save_log_path: Some(path.clone()),
            ..Default::default()
        },
    )
    .unwrap();
    sender.close().await.unwrap();

    assert!(path.join("stream_local_save.diskqueue.meta.dat").exists());
    assert!(path.join("backup_local_save.diskqueue.meta.dat").exists());
}

// =========================================================================
// backup_only
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_backup_only_success() {
    let sink = ScriptedSink::new(|_, _| Ok(()));
    let (sender, primary, backup) = start(sink.clone(), Strategy::BackupOnly);

    let stats = sender.send(batch(json!([{"msg": "hello"}]))).await;
    assert_eq!(stats.success, 1);
    assert_eq!(stats.errors, 0);
    assert_eq!(stats.lag, 0);
    assert!(stats.is_ok());
    assert!(stats.fault_tolerant);

    assert_eq!(sink.accepted_records(), batch(json!([{"msg": "hello"}])));
    assert!(primary.puts.lock().is_empty());
    assert!(backup.puts.lock().is_empty());

    sender.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_backup_only_partial_reject_queues_failed_subset() {
    let failed = batch(json!([{"b": 2}]));
    let sink = {
        let failed = failed.clone();
        ScriptedSink::new(move |_, _| {
            Err(SendError::new("partial reject", failed.clone(), FailureKind::Default).into())
        })
    };
    let (sender, _primary, backup) = start(sink, Strategy::BackupOnly);

    let stats = sender.send(batch(json!([{"a": 1}, {"b": 2}]))).await;

    // The sink failed but the records were stored, so nothing is reported
    assert!(stats.error_detail.is_none());
    assert_eq!(stats.success, 0);
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.lag, 1);

    let puts = backup.put_batches();
    assert_eq!(puts.len(), 1);
    assert_eq!(puts[0], failed);

    assert_eq!(abandoned(sender.close().await), failed);
}

#[tokio::test(start_paused = true)]
async fn test_backup_only_reports_records_that_cannot_be_queued() {
    let sink = ScriptedSink::new(|_, _| Err(SinkError::Unclassified("connection refused".into())));
    let (sender, _primary, backup) = start(sink, Strategy::BackupOnly);
    backup.fail_puts.store(true, Ordering::SeqCst);

    let records = batch(json!([{"a": 1}, {"b": 2.5}]));
    let stats = sender.send(records.clone()).await;

    let detail = stats.error_detail.expect("records were lost");
    assert_eq!(detail.failed, records);
    assert_eq!(detail.kind, FailureKind::Default);
    assert_eq!(detail.message, "save data to backend queue error");
    assert_eq!(stats.errors, 1);

    // The detail is also visible through the sender's snapshot
    assert!(!sender.stats().is_ok());

    sender.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_backup_only_full_memory_queue_surfaces_error() {
    let sink = ScriptedSink::new(|_, _| Err(SinkError::Unclassified("down".into())));
    let primary = Arc::new(MemoryQueue::new("stream_memory", 1));
    let backup = Arc::new(MemoryQueue::new("backup_memory", 1));
    let sender =
        FaultTolerantSender::with_queues(sink, &config(Strategy::BackupOnly), primary, backup)
            .unwrap();

    let first = sender.send(batch(json!([{"n": 1}]))).await;
    assert!(first.is_ok());
    assert_eq!(first.lag, 1);

    let second = sender.send(batch(json!([{"n": 2}]))).await;
    assert_eq!(second.error_detail.unwrap().failed, batch(json!([{"n": 2}])));

    assert_eq!(abandoned(sender.close().await), batch(json!([{"n": 1}])));
}

#[tokio::test(start_paused = true)]
async fn test_failed_records_are_eventually_redelivered() {
    // Fail the first three attempts, then accept everything
    let sink = ScriptedSink::new(|_, call| {
        if call <= 3 {
            Err(SinkError::Unclassified("timeout".into()))
        } else {
            Ok(())
        }
    });
    let (sender, _primary, backup) = start(sink.clone(), Strategy::BackupOnly);

    let records = batch(json!([{"a": 1}, {"b": 2}, {"c": 3}]));
    let stats = sender.send(records.clone()).await;
    assert!(stats.is_ok());

    wait_until(|| !sink.accepted_records().is_empty()).await;
    assert_eq!(record_keys(&sink.accepted_records()), record_keys(&records));
    assert_eq!(backup.depth(), 0);

    let final_stats = sender.stats();
    assert_eq!(final_stats.success, 1);
    assert_eq!(final_stats.errors, 3);

    sender.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_worker_backoff_grows_and_caps() {
    let sink = ScriptedSink::new(|_, _| Err(SinkError::Unclassified("rate limited".into())));
    let (sender, _primary, _backup) = start(sink.clone(), Strategy::BackupOnly);

    sender.send(batch(json!([{"k": "v"}]))).await;
    wait_until(|| sink.call_count() >= 15).await;

    // Skip the synchronous attempt; the rest come from the backup worker
    let times: Vec<Instant> = sink.calls.lock().iter().skip(1).map(|(t, _)| *t).collect();
    let gaps: Vec<u64> = times
        .windows(2)
        .map(|w| (w[1] - w[0]).as_secs())
        .collect();

    assert_eq!(&gaps[..4], &[1, 2, 3, 4]);
    assert!(gaps.windows(2).all(|w| w[0] <= w[1]));
    assert!(gaps.iter().all(|g| *g <= 10));
    assert_eq!(*gaps.last().unwrap(), 10);

    assert_eq!(abandoned(sender.close().await), batch(json!([{"k": "v"}])));
}

// =========================================================================
// always_save
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_always_save_queues_before_delivery() {
    let dir = tempfile::tempdir().unwrap();
    let sink = ScriptedSink::new(|_, _| Ok(()));
    let sender = FaultTolerantSender::new(
        sink.clone(),
        FtConfig {
            save_log_path: Some(dir.path().to_path_buf()),
            sync_every: 1,
            ..Default::default()
        },
    )
    .unwrap();

    let stats = sender.send(batch(json!([{"x": "y"}]))).await;
    assert!(stats.error_detail.is_none());
    assert_eq!(stats.lag, 1);
    // Nothing is delivered synchronously
    assert_eq!(sink.call_count(), 0);

    wait_until(|| sink.call_count() == 1).await;
    assert_eq!(sink.accepted_records(), batch(json!([{"x": "y"}])));

    sender.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_always_save_enqueue_failure_is_reported() {
    let sink = ScriptedSink::new(|_, _| Ok(()));
    let (sender, primary, _backup) = start(sink, Strategy::AlwaysSave);
    primary.fail_puts.store(true, Ordering::SeqCst);

    let records = batch(json!([{"x": "y"}]));
    let stats = sender.send(records.clone()).await;
    let detail = stats.error_detail.unwrap();
    assert_eq!(detail.failed, records);
    assert!(detail.message.contains("stream_memory"));

    primary.fail_puts.store(false, Ordering::SeqCst);
    assert!(sender.send(records.clone()).await.is_ok());

    assert_eq!(abandoned(sender.close().await), records);
}

#[tokio::test(start_paused = true)]
async fn test_always_save_failures_move_to_backup_queue() {
    let sink = ScriptedSink::new(|_, call| {
        if call == 1 {
            Err(SinkError::Unclassified("flaky".into()))
        } else {
            Ok(())
        }
    });
    let (sender, _primary, backup) = start(sink.clone(), Strategy::AlwaysSave);

    let records = batch(json!([{"id": 1}, {"id": 2}]));
    sender.send(records.clone()).await;

    wait_until(|| !sink.accepted_records().is_empty()).await;
    // The retry went through the backup queue, never back to the primary
    assert_eq!(backup.put_batches(), vec![records.clone()]);
    assert_eq!(sink.accepted_records(), records);

    sender.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_binary_unpack_bisects_until_accepted() {
    // Only single-record batches fit
    let sink = ScriptedSink::new(|records, _| {
        if records.len() > 1 {
            Err(SendError::new("too large", records.to_vec(), FailureKind::BinaryUnpack).into())
        } else {
            Ok(())
        }
    });
    let (sender, _primary, backup) = start(sink.clone(), Strategy::AlwaysSave);

    let records = batch(json!([{"i": 0}, {"i": 1}, {"i": 2}, {"i": 3}, {"i": 4}]));
    sender.send(records.clone()).await;

    wait_until(|| sink.accepted_records().len() == records.len()).await;
    assert_eq!(record_keys(&sink.accepted_records()), record_keys(&records));

    // Every queued unit is a half of a rejected parent
    let units = backup.put_batches();
    assert_eq!(units[0].len() + units[1].len(), records.len());
    assert!(sink.accepted.lock().iter().all(|b| b.len() == 1));

    sender.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_undecodable_entry_is_dropped_and_counted() {
    let sink = ScriptedSink::new(|_, _| Ok(()));
    let (sender, primary, _backup) = start(sink.clone(), Strategy::AlwaysSave);

    primary.put(b"definitely not json".to_vec()).await.unwrap();
    sender.send(batch(json!([{"ok": true}]))).await;

    wait_until(|| sink.call_count() == 1).await;
    wait_until(|| sender.stats().errors == 1).await;
    assert_eq!(sender.stats().success, 1);
    assert_eq!(sink.accepted_records(), batch(json!([{"ok": true}])));

    sender.close().await.unwrap();
}

// =========================================================================
// Shutdown
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_close_persists_all_queued_records() {
    let dir = tempfile::tempdir().unwrap();
    let sink = ScriptedSink::new(|_, _| Err(SinkError::Unclassified("offline".into())));
    let sender = FaultTolerantSender::new(
        sink.clone(),
        FtConfig {
            save_log_path: Some(dir.path().to_path_buf()),
            sync_every: 1,
            procs: 2,
            ..Default::default()
        },
    )
    .unwrap();

    let mut expected = Vec::new();
    for i in 0..3 {
        let records = batch(json!([{ "seq": i }]));
        expected.extend(records.clone());
        assert!(sender.send(records).await.is_ok());
    }

    sender.close().await.unwrap();
    assert!(sink.closed.load(Ordering::SeqCst));

    // Nothing can be written once closed
    assert!(sender.send(batch(json!([{"late": 1}]))).await.error_detail.is_some());
    // A second close is harmless
    sender.close().await.unwrap();

    let options = DiskQueueOptions::default();
    let primary = DiskQueue::open("stream_local_save", dir.path(), options.clone()).unwrap();
    let backup = DiskQueue::open("backup_local_save", dir.path(), options).unwrap();
    assert_eq!(primary.depth() + backup.depth(), 3);

    let mut stored = Vec::new();
    for queue in [&primary, &backup] {
        for _ in 0..queue.depth() {
            let blob = queue.recv().await.unwrap();
            stored.extend(decode_batch(&blob).unwrap());
        }
    }
    assert_eq!(record_keys(&stored), record_keys(&expected));
}

#[tokio::test(start_paused = true)]
async fn test_close_waits_for_worker_in_backoff() {
    let sink = ScriptedSink::new(|_, _| Err(SinkError::Unclassified("offline".into())));
    let (sender, _primary, backup) = start(sink.clone(), Strategy::BackupOnly);

    sender.send(batch(json!([{"a": 1}]))).await;
    wait_until(|| sink.call_count() >= 3).await;

    let started = Instant::now();
    let left = abandoned(sender.close().await);
    // The backup worker finishes its current sleep before it sees the stop flag
    assert!(started.elapsed() <= Duration::from_secs(10));
    assert!(sink.closed.load(Ordering::SeqCst));

    // The failed batch was still in the backup queue and is handed back
    assert_eq!(left, batch(json!([{"a": 1}])));
    assert_eq!(backup.depth(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_close_returns_records_left_in_memory_queues() {
    let sink = ScriptedSink::new(|_, _| Ok(()));
    let sender = FaultTolerantSender::new(sink.clone(), config(Strategy::AlwaysSave)).unwrap();

    let mut expected = Vec::new();
    for i in 0..5 {
        let records = batch(json!([{ "seq": i }]));
        expected.extend(records.clone());
        let stats = sender.send(records).await;
        assert!(stats.is_ok());
        assert_eq!(stats.lag, i + 1);
    }

    // Workers never got a turn, so all five batches are still buffered
    let left = abandoned(sender.close().await);
    assert_eq!(left, expected);
    assert_eq!(sink.call_count(), 0);
    assert!(sink.closed.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_close_waits_for_first() {
    let sink = ScriptedSink::new(|_, _| Err(SinkError::Unclassified("offline".into())));
    let dir = tempfile::tempdir().unwrap();
    let sender = FaultTolerantSender::new(
        sink.clone(),
        FtConfig {
            save_log_path: Some(dir.path().to_path_buf()),
            strategy: Strategy::BackupOnly,
            ..Default::default()
        },
    )
    .unwrap();

    sender.send(batch(json!([{"a": 1}]))).await;
    wait_until(|| sink.call_count() >= 2).await;

    // The first close waits out the backup worker's sleep
    let (first, second) = tokio::join!(sender.close(), async {
        let result = sender.close().await;
        (result, sink.closed.load(Ordering::SeqCst))
    });
    first.unwrap();
    let (result, sink_closed_before_return) = second;
    result.unwrap();
    assert!(sink_closed_before_return);
}

#[tokio::test(start_paused = true)]
async fn test_worker_backoff_resets_after_success() {
    // Only the fourth call succeeds
    let sink = ScriptedSink::new(|_, call| {
        if call == 4 {
            Ok(())
        } else {
            Err(SinkError::Unclassified("unstable".into()))
        }
    });
    let (sender, _primary, _backup) = start(sink.clone(), Strategy::BackupOnly);

    // Call 1 is synchronous, calls 2..=4 come from the backup worker
    sender.send(batch(json!([{"round": 1}]))).await;
    wait_until(|| sink.accepted_records().len() == 1).await;

    // Call 5 is synchronous, then the worker fails at 6 and retries at 7
    sender.send(batch(json!([{"round": 2}]))).await;
    wait_until(|| sink.call_count() >= 7).await;

    let times: Vec<Instant> = sink.calls.lock().iter().map(|(t, _)| *t).collect();
    let gap = |i: usize| (times[i] - times[i - 1]).as_secs();
    assert_eq!(gap(2), 1);
    assert_eq!(gap(3), 2);
    // Back to the initial delay, not 3s
    assert_eq!(gap(6), 1);

    assert_eq!(abandoned(sender.close().await), batch(json!([{"round": 2}])));
}

#[tokio::test]
async fn test_envelope_written_to_queue_matches_codec() {
    let sink = ScriptedSink::new(|_, _| Ok(()));
    let (sender, primary, _backup) = start(sink, Strategy::AlwaysSave);

    let records = batch(json!([{"n": 3, "f": 1.5}]));
    sender.send(records.clone()).await;
    assert_eq!(primary.puts.lock()[0], encode_batch(&records).unwrap());

    assert_eq!(abandoned(sender.close().await), records);
}
