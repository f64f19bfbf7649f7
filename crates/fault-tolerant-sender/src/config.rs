//! Configuration for the fault-tolerant sender.

use crate::{FtError, FtResult};
use backend_queue::DiskQueueOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Bytes in one megabyte.
pub const MB: u64 = 1024 * 1024;

/// Default number of queue operations between forced syncs.
pub const DEFAULT_SYNC_EVERY: u64 = 10;

/// Default disk write limit in MB/s.
pub const DEFAULT_WRITE_LIMIT_MB: u64 = 10;

/// Default number of primary-queue workers.
pub const DEFAULT_PROCS: usize = 1;

/// Default capacity of each memory queue.
pub const DEFAULT_MEMORY_CHANNEL_SIZE: usize = 100;

/// Runner name used when none is configured.
pub const UNDEFINED_RUNNER_NAME: &str = "UndefinedRunnerName";

/// When data is written to local storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Deliver immediately; only failed records are stored for retry.
    BackupOnly,
    /// Store every batch first; background workers deliver from storage.
    #[default]
    AlwaysSave,
}

/// Fault-tolerant sender configuration.
///
/// Field names on the wire follow the `ft_*` option keys. Every option is
/// optional; see the `DEFAULT_*` constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FtConfig {
    /// Queue operations between forced durability syncs.
    #[serde(rename = "ft_sync_every")]
    pub sync_every: u64,
    /// Directory for the disk queues. Required unless `memory_channel`.
    #[serde(rename = "ft_save_log_path")]
    pub save_log_path: Option<PathBuf>,
    /// Disk write throughput cap in MB/s. Zero disables the limit.
    #[serde(rename = "ft_write_limit")]
    pub write_limit_mb: u64,
    /// Delivery strategy.
    #[serde(rename = "ft_strategy")]
    pub strategy: Strategy,
    /// Number of workers draining the primary queue.
    #[serde(rename = "ft_procs")]
    pub procs: usize,
    /// Use memory-bounded queues instead of disk queues.
    #[serde(rename = "ft_memory_channel")]
    pub memory_channel: bool,
    /// Capacity of each memory queue.
    #[serde(rename = "ft_memory_channel_size")]
    pub memory_channel_size: usize,
    /// Name of the owning pipeline, included in log lines.
    pub runner_name: String,
}

impl Default for FtConfig {
    fn default() -> Self {
        Self {
            sync_every: DEFAULT_SYNC_EVERY,
            save_log_path: None,
            write_limit_mb: DEFAULT_WRITE_LIMIT_MB,
            strategy: Strategy::default(),
            procs: DEFAULT_PROCS,
            memory_channel: false,
            memory_channel_size: DEFAULT_MEMORY_CHANNEL_SIZE,
            runner_name: UNDEFINED_RUNNER_NAME.to_string(),
        }
    }
}

impl FtConfig {
    /// Load configuration from a JSON file, then apply environment overrides.
    pub fn load_from_file(path: &Path) -> FtResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: FtConfig = serde_json::from_str(&content)
            .map_err(|e| FtError::Config(format!("{}: {}", path.display(), e)))?;
        config.load_from_env();
        Ok(config)
    }

    /// Override the runner name from `FT_RUNNER_NAME`.
    fn load_from_env(&mut self) {
        if let Ok(name) = std::env::var("FT_RUNNER_NAME") {
            if !name.trim().is_empty() {
                self.runner_name = name.trim().to_string();
            }
        }
    }

    /// Check that the options can build a sender.
    pub fn validate(&self) -> FtResult<()> {
        if !self.memory_channel && self.save_log_path.is_none() {
            return Err(FtError::Config(
                "ft_save_log_path is required unless ft_memory_channel is set".to_string(),
            ));
        }
        if self.procs == 0 {
            return Err(FtError::Config("ft_procs must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Options for the disk queues derived from this configuration.
    pub fn disk_queue_options(&self) -> DiskQueueOptions {
        DiskQueueOptions {
            sync_every: self.sync_every,
            write_rate_limit: self.write_limit_mb.saturating_mul(MB),
            ..DiskQueueOptions::default()
        }
    }
}
