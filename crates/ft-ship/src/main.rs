//! ft-ship - ship NDJSON records from stdin through a fault-tolerant sender.

mod output;
mod ship;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use fault_tolerant_sender::{FaultTolerantSender, FtConfig, Sink, Strategy};
use tokio::io::BufReader;
use tracing::{info, warn};

use crate::output::JsonLinesSink;

/// Fault-tolerant NDJSON shipper.
#[derive(Parser)]
#[command(name = "ft-ship")]
#[command(about = "Ship NDJSON records with local queueing and retry")]
#[command(version)]
struct Cli {
    /// Sender configuration file (JSON)
    #[arg(short, long, env = "FT_SHIP_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Append logs as JSON lines to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Records per batch
    #[arg(short, long, default_value_t = 100)]
    batch_size: usize,

    /// Destination file; defaults to stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Directory for the disk queues; overrides ft_save_log_path
    #[arg(long, env = "FT_SHIP_SAVE_DIR")]
    save_dir: Option<PathBuf>,
}

/// Build the sender configuration from the command line.
///
/// Without a config file or save directory the sender delivers immediately
/// and keeps failed records in memory only.
fn resolve_config(config: Option<&Path>, save_dir: Option<PathBuf>) -> anyhow::Result<FtConfig> {
    let mut resolved = match config {
        Some(path) => FtConfig::load_from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None if save_dir.is_none() => {
            warn!("No config or save directory given, failed records are kept in memory only");
            FtConfig {
                strategy: Strategy::BackupOnly,
                memory_channel: true,
                ..Default::default()
            }
        }
        None => FtConfig::default(),
    };

    if let Some(dir) = save_dir {
        resolved.save_log_path = Some(dir);
        resolved.memory_channel = false;
    }
    resolved.validate().context("invalid sender configuration")?;
    Ok(resolved)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    observability::init_with_config(observability::LogConfig {
        service_name: "ft-ship".into(),
        default_level: cli.log_level.clone(),
        log_path: cli.log_file.clone(),
        also_stderr: false,
    })
    .context("failed to initialize logging")?;

    let config = resolve_config(cli.config.as_deref(), cli.save_dir.clone())?;

    let sink: Arc<dyn Sink> = match &cli.output {
        Some(path) => Arc::new(
            JsonLinesSink::append_to(path)
                .await
                .with_context(|| format!("failed to open output {}", path.display()))?,
        ),
        None => Arc::new(JsonLinesSink::stdout()),
    };

    let sender = FaultTolerantSender::new(sink, config).context("failed to start sender")?;

    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    let input = BufReader::new(tokio::io::stdin());
    let shipped = ship::ship(input, &sender, cli.batch_size, shutdown).await;

    let mut summary = shipped.context("failed to read input")?;
    ship::close_sender(&sender, &mut summary)
        .await
        .context("failed to close sender")?;
    let stats = sender.stats();

    info!(
        lines = summary.lines,
        skipped = summary.skipped,
        batches = summary.batches,
        lost = summary.lost,
        success = stats.success,
        errors = stats.errors,
        lag = stats.lag,
        "Shipping finished"
    );
    eprintln!(
        "{}: lines={} skipped={} batches={} lost={} success={} errors={} lag={}",
        sender.name(),
        summary.lines,
        summary.skipped,
        summary.batches,
        summary.lost,
        stats.success,
        stats.errors,
        stats.lag
    );

    if summary.lost > 0 {
        anyhow::bail!("{} records were lost", summary.lost);
    }
    Ok(())
}
