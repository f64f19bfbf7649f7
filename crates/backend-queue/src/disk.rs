//! Disk-backed segment queue.
//!
//! Blobs are appended to numbered segment files as `u32` big-endian length
//! prefixed frames. A small metadata file records the depth plus the read and
//! write positions; it is rewritten every `sync_every` operations, on segment
//! rotation, after `sync_timeout` has elapsed, and on close.
//!
//! ```text
//! <dir>/<name>.diskqueue.meta.dat
//! <dir>/<name>.diskqueue.000000.dat
//! <dir>/<name>.diskqueue.000001.dat
//! ```

use crate::{BackendQueue, QueueError, QueueResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Segment files are rotated once they would exceed this size.
pub const MAX_BYTES_PER_FILE: u64 = 100 * 1024 * 1024;

/// Metadata is persisted at least this often while the queue is in use.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(2);

const FRAME_HEADER_LEN: u64 = 4;

/// Tuning knobs for a [`DiskQueue`].
#[derive(Debug, Clone)]
pub struct DiskQueueOptions {
    /// Rotate to a new segment once the current one would exceed this size.
    pub max_bytes_per_file: u64,
    /// Smallest accepted message.
    pub min_msg_size: usize,
    /// Largest accepted message.
    pub max_msg_size: usize,
    /// Number of reads plus writes between forced syncs.
    pub sync_every: u64,
    /// Maximum time between syncs while the queue is active.
    pub sync_timeout: Duration,
    /// Write throughput cap in bytes per second. Zero disables the limit.
    pub write_rate_limit: u64,
}

impl Default for DiskQueueOptions {
    fn default() -> Self {
        Self {
            max_bytes_per_file: MAX_BYTES_PER_FILE,
            min_msg_size: 0,
            max_msg_size: MAX_BYTES_PER_FILE as usize,
            sync_every: 10,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
            write_rate_limit: 0,
        }
    }
}

/// Mutable queue state, guarded by one lock.
struct DiskState {
    read_file_num: u64,
    read_pos: u64,
    write_file_num: u64,
    write_pos: u64,
    writer: Option<BufWriter<File>>,
    reader: Option<BufReader<File>>,
    ops_since_sync: u64,
    last_sync: Instant,
    closed: bool,
}

/// Fixed one-second window throughput limiter.
struct WriteLimiter {
    bytes_per_sec: u64,
    window: AsyncMutex<(Instant, u64)>,
}

impl WriteLimiter {
    fn new(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec,
            window: AsyncMutex::new((Instant::now(), 0)),
        }
    }

    async fn acquire(&self, bytes: u64) {
        if self.bytes_per_sec == 0 {
            return;
        }

        let mut window = self.window.lock().await;
        let now = Instant::now();
        if now.duration_since(window.0) >= Duration::from_secs(1) {
            *window = (now, 0);
        }

        // A single oversized write is let through on a fresh window.
        if window.1 > 0 && window.1 + bytes > self.bytes_per_sec {
            let next = window.0 + Duration::from_secs(1);
            tokio::time::sleep_until(next).await;
            *window = (Instant::now(), 0);
        }
        window.1 += bytes;
    }
}

/// Append-only on-disk FIFO queue.
///
/// Safe for concurrent producers and consumers. Positions are persisted
/// lazily, so after a crash anything read since the last sync is delivered
/// again.
pub struct DiskQueue {
    name: String,
    dir: PathBuf,
    options: DiskQueueOptions,
    state: Mutex<DiskState>,
    depth: AtomicU64,
    limiter: WriteLimiter,
    notify: Notify,
}

impl DiskQueue {
    /// Open (or create) the queue `name` inside `dir`.
    ///
    /// Existing metadata is loaded so a reopened queue continues where the
    /// previous instance stopped.
    pub fn open(
        name: impl Into<String>,
        dir: impl AsRef<Path>,
        options: DiskQueueOptions,
    ) -> QueueResult<Self> {
        let name = name.into();
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let queue = Self {
            limiter: WriteLimiter::new(options.write_rate_limit),
            state: Mutex::new(DiskState {
                read_file_num: 0,
                read_pos: 0,
                write_file_num: 0,
                write_pos: 0,
                writer: None,
                reader: None,
                ops_since_sync: 0,
                last_sync: Instant::now(),
                closed: false,
            }),
            depth: AtomicU64::new(0),
            notify: Notify::new(),
            name,
            dir,
            options,
        };

        queue.load_metadata()?;
        info!(
            queue = %queue.name,
            dir = %queue.dir.display(),
            depth = queue.depth(),
            "Disk queue opened"
        );
        Ok(queue)
    }

    fn metadata_path(&self) -> PathBuf {
        self.dir.join(format!("{}.diskqueue.meta.dat", self.name))
    }

    fn segment_path(&self, file_num: u64) -> PathBuf {
        self.dir
            .join(format!("{}.diskqueue.{:06}.dat", self.name, file_num))
    }

    fn load_metadata(&self) -> QueueResult<()> {
        let path = self.metadata_path();
        if !path.exists() {
            return Ok(());
        }

        let content = fs::read_to_string(&path)?;
        let (depth, read, write) = parse_metadata(&content)?;

        let mut state = self.state.lock();
        state.read_file_num = read.0;
        state.read_pos = read.1;
        state.write_file_num = write.0;
        state.write_pos = write.1;
        self.depth.store(depth, Ordering::SeqCst);
        Ok(())
    }

    fn persist_metadata(&self, state: &DiskState) -> QueueResult<()> {
        let path = self.metadata_path();
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            write!(
                file,
                "{}\n{},{}\n{},{}\n",
                self.depth.load(Ordering::SeqCst),
                state.read_file_num,
                state.read_pos,
                state.write_file_num,
                state.write_pos
            )?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn sync(&self, state: &mut DiskState) -> QueueResult<()> {
        if let Some(writer) = state.writer.as_mut() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        self.persist_metadata(state)?;
        state.ops_since_sync = 0;
        state.last_sync = Instant::now();
        Ok(())
    }

    fn maybe_sync(&self, state: &mut DiskState) -> QueueResult<()> {
        state.ops_since_sync += 1;
        if state.ops_since_sync >= self.options.sync_every.max(1)
            || state.last_sync.elapsed() >= self.options.sync_timeout
        {
            self.sync(state)?;
        }
        Ok(())
    }

    fn rotate_writer(&self, state: &mut DiskState) -> QueueResult<()> {
        if let Some(mut writer) = state.writer.take() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        state.write_file_num += 1;
        state.write_pos = 0;
        debug!(queue = %self.name, file_num = state.write_file_num, "Rotated write segment");
        self.sync(state)
    }

    fn write_frame(&self, state: &mut DiskState, blob: &[u8]) -> QueueResult<()> {
        let frame_len = FRAME_HEADER_LEN + blob.len() as u64;
        if state.write_pos > 0 && state.write_pos + frame_len > self.options.max_bytes_per_file {
            self.rotate_writer(state)?;
        }

        if state.writer.is_none() {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .open(self.segment_path(state.write_file_num))?;
            // Drop any tail written after the last sync of a previous run.
            file.set_len(state.write_pos)?;
            file.seek(SeekFrom::Start(state.write_pos))?;
            state.writer = Some(BufWriter::new(file));
        }

        if let Some(writer) = state.writer.as_mut() {
            writer.write_all(&(blob.len() as u32).to_be_bytes())?;
            writer.write_all(blob)?;
            // Readers open their own handle, so the frame must reach the OS.
            writer.flush()?;
        }
        state.write_pos += frame_len;
        self.depth.fetch_add(1, Ordering::SeqCst);
        self.maybe_sync(state)
    }

    fn read_frame(&self, state: &mut DiskState) -> QueueResult<Option<Vec<u8>>> {
        loop {
            if state.read_file_num == state.write_file_num && state.read_pos >= state.write_pos {
                return Ok(None);
            }

            if state.read_file_num < state.write_file_num {
                let path = self.segment_path(state.read_file_num);
                let len = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                if state.read_pos >= len {
                    self.finish_segment(state, &path);
                    continue;
                }
            }

            if state.reader.is_none() {
                let mut file = File::open(self.segment_path(state.read_file_num))?;
                file.seek(SeekFrom::Start(state.read_pos))?;
                state.reader = Some(BufReader::new(file));
            }

            let Some(reader) = state.reader.as_mut() else {
                return Ok(None);
            };

            let mut header = [0u8; FRAME_HEADER_LEN as usize];
            reader.read_exact(&mut header)?;
            let size = u32::from_be_bytes(header) as usize;
            if size < self.options.min_msg_size || size > self.options.max_msg_size {
                return Err(QueueError::Corrupt(format!(
                    "frame of {} bytes at {}:{} in queue {}",
                    size, state.read_file_num, state.read_pos, self.name
                )));
            }

            let mut blob = vec![0u8; size];
            reader.read_exact(&mut blob)?;
            state.read_pos += FRAME_HEADER_LEN + size as u64;

            let _ = self
                .depth
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| d.checked_sub(1));
            self.maybe_sync(state)?;
            return Ok(Some(blob));
        }
    }

    fn finish_segment(&self, state: &mut DiskState, path: &Path) {
        state.reader = None;
        if let Err(err) = fs::remove_file(path) {
            warn!(queue = %self.name, path = %path.display(), error = %err, "Failed to remove consumed segment");
        }
        state.read_file_num += 1;
        state.read_pos = 0;
    }

    /// Frames between the read cursor and the write cursor, counted on disk.
    fn count_unread_frames(&self, state: &DiskState) -> u64 {
        (state.read_file_num..=state.write_file_num)
            .map(|file_num| {
                let start = if file_num == state.read_file_num {
                    state.read_pos
                } else {
                    0
                };
                let end = if file_num == state.write_file_num {
                    state.write_pos
                } else {
                    fs::metadata(self.segment_path(file_num))
                        .map(|m| m.len())
                        .unwrap_or(0)
                };
                self.count_segment_frames(file_num, start, end)
                    .unwrap_or_else(|err| {
                        warn!(queue = %self.name, file_num, error = %err, "Cannot count frames in segment");
                        0
                    })
            })
            .sum()
    }

    fn count_segment_frames(&self, file_num: u64, start: u64, end: u64) -> QueueResult<u64> {
        if start >= end {
            return Ok(0);
        }
        let mut reader = BufReader::new(File::open(self.segment_path(file_num))?);
        reader.seek(SeekFrom::Start(start))?;

        let mut header = [0u8; FRAME_HEADER_LEN as usize];
        let mut pos = start;
        let mut frames = 0;
        while pos + FRAME_HEADER_LEN <= end {
            reader.read_exact(&mut header)?;
            let size = u64::from(u32::from_be_bytes(header));
            pos += FRAME_HEADER_LEN + size;
            if pos > end {
                break;
            }
            reader.seek_relative(size as i64)?;
            frames += 1;
        }
        Ok(frames)
    }

    /// Move the read cursor past an unreadable segment.
    fn skip_bad_segment(&self, state: &mut DiskState) {
        let bad = self.segment_path(state.read_file_num);
        state.reader = None;

        if state.read_file_num == state.write_file_num {
            if let Err(err) = self.rotate_writer(state) {
                error!(queue = %self.name, error = %err, "Failed to rotate past bad segment");
            }
        }

        let renamed = bad.with_extension("bad");
        if let Err(err) = fs::rename(&bad, &renamed) {
            warn!(queue = %self.name, path = %bad.display(), error = %err, "Failed to quarantine bad segment");
        }
        state.read_file_num += 1;
        state.read_pos = 0;

        let remaining = self.count_unread_frames(state);
        warn!(queue = %self.name, depth = remaining, "Depth recounted after skipping segment");
        self.depth.store(remaining, Ordering::SeqCst);
        if let Err(err) = self.persist_metadata(state) {
            error!(queue = %self.name, error = %err, "Failed to persist metadata after skipping segment");
        }
    }
}

#[async_trait]
impl BackendQueue for DiskQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, blob: Vec<u8>) -> QueueResult<()> {
        if blob.len() < self.options.min_msg_size || blob.len() > self.options.max_msg_size {
            return Err(QueueError::MessageSize {
                name: self.name.clone(),
                size: blob.len(),
                max: self.options.max_msg_size,
            });
        }

        self.limiter.acquire(FRAME_HEADER_LEN + blob.len() as u64).await;

        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(QueueError::Closed(self.name.clone()));
            }
            self.write_frame(&mut state, &blob)?;
        }

        self.notify.notify_waiters();
        Ok(())
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                match self.read_frame(&mut state) {
                    Ok(Some(blob)) => return Some(blob),
                    Ok(None) => {}
                    Err(err) => {
                        error!(
                            queue = %self.name,
                            file_num = state.read_file_num,
                            error = %err,
                            "Unreadable segment, skipping to next file"
                        );
                        self.skip_bad_segment(&mut state);
                        continue;
                    }
                }
            }

            notified.await;
        }
    }

    fn depth(&self) -> u64 {
        self.depth.load(Ordering::SeqCst)
    }

    async fn close(&self) -> QueueResult<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            self.sync(&mut state)?;
            state.writer = None;
            state.reader = None;
        }
        self.notify.notify_waiters();

        info!(queue = %self.name, depth = self.depth(), "Disk queue closed");
        Ok(())
    }
}

type Position = (u64, u64);

fn parse_metadata(content: &str) -> QueueResult<(u64, Position, Position)> {
    let mut lines = content.lines();
    let corrupt = || QueueError::Corrupt(format!("bad metadata: {:?}", content));

    let depth = lines
        .next()
        .and_then(|l| l.trim().parse::<u64>().ok())
        .ok_or_else(corrupt)?;
    let read = lines.next().and_then(parse_position).ok_or_else(corrupt)?;
    let write = lines.next().and_then(parse_position).ok_or_else(corrupt)?;
    Ok((depth, read, write))
}

fn parse_position(line: &str) -> Option<Position> {
    let (file_num, pos) = line.trim().split_once(',')?;
    Some((file_num.parse().ok()?, pos.parse().ok()?))
}
