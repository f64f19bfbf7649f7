//! # Observability
//!
//! Process-wide logging setup. Binaries call [`init`] or [`init_with_config`]
//! once at startup and use the `tracing` macros everywhere else. Library
//! crates never install a subscriber themselves.
//!
//! Output goes to one of:
//!
//! - compact text on stderr (no log path configured)
//! - JSON lines appended to a file, optionally mirrored to stderr
//!
//! `RUST_LOG` always wins over the configured default level.
//!
//! ```rust,ignore
//! fn main() {
//!     observability::init_with_config(observability::LogConfig {
//!         service_name: "ft-ship".into(),
//!         default_level: "debug".into(),
//!         log_path: Some("/var/log/ft-ship.jsonl".into()),
//!         ..Default::default()
//!     })?;
//!
//!     tracing::info!("ready");
//! }
//! ```

mod file;

pub use file::LogFileWriter;

use std::io;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Name of the service, written once at startup.
    pub service_name: String,

    /// Default filter directive (e.g. "info", "fault_tolerant_sender=debug").
    /// Overridden by `RUST_LOG`.
    pub default_level: String,

    /// Append JSON lines to this file instead of writing text to stderr.
    pub log_path: Option<PathBuf>,

    /// Mirror to stderr when `log_path` is set.
    pub also_stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".into(),
            default_level: "info".into(),
            log_path: None,
            also_stderr: false,
        }
    }
}

/// Initialize logging to stderr at `info`.
pub fn init(service_name: &str) -> io::Result<()> {
    init_with_config(LogConfig {
        service_name: service_name.into(),
        ..Default::default()
    })
}

/// Initialize logging with custom configuration.
///
/// # Errors
///
/// Returns an error when the log file cannot be opened. A second call in the
/// same process is ignored.
pub fn init_with_config(config: LogConfig) -> io::Result<()> {
    let filter = env_filter(&config.default_level);

    let installed = match &config.log_path {
        None => tracing_subscriber::registry()
            .with(stderr_layer().with_filter(filter))
            .try_init(),
        Some(path) => {
            let writer = LogFileWriter::open(path)?;
            let json_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false)
                .with_writer(writer)
                .with_filter(filter);
            let mirror = config
                .also_stderr
                .then(|| stderr_layer().with_filter(env_filter(&config.default_level)));

            tracing_subscriber::registry()
                .with(json_layer)
                .with(mirror)
                .try_init()
        }
    };

    if installed.is_ok() {
        tracing::info!(
            service = %config.service_name,
            log_path = ?config.log_path,
            "observability initialized"
        );
    }
    Ok(())
}

/// `RUST_LOG` if set and valid, otherwise `default_level`.
pub fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

fn stderr_layer<S>() -> impl Layer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer()
        .with_target(true)
        .compact()
        .with_writer(io::stderr)
}
