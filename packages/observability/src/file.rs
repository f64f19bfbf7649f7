//! Append-only JSON-lines log file.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;

struct LogFile {
    path: PathBuf,
    file: Mutex<File>,
}

/// Log file shared by every event writer of the process.
///
/// Each event is collected in memory and lands in the file with a single
/// append, so lines from several processes never interleave.
#[derive(Clone)]
pub struct LogFileWriter {
    shared: Arc<LogFile>,
}

impl LogFileWriter {
    /// Open `path` for appending, creating parent directories as needed.
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            shared: Arc::new(LogFile {
                path: path.to_path_buf(),
                file: Mutex::new(file),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }
}

/// Buffer for one event. Written out when dropped.
pub struct LogLine<'a> {
    file: &'a Mutex<File>,
    buf: Vec<u8>,
}

impl Write for LogLine<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for LogLine<'_> {
    fn drop(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        // Nowhere left to report a failed log write.
        let _ = self.file.lock().write_all(&self.buf);
    }
}

impl<'a> MakeWriter<'a> for LogFileWriter {
    type Writer = LogLine<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        LogLine {
            file: &self.shared.file,
            buf: Vec::with_capacity(256),
        }
    }
}
