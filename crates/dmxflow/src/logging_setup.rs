//! Subscriber setup for the command line tool
//!
//! Console output goes to stderr so command output on stdout stays clean.
//! File output rolls daily under `LogConfig::log_dir`, one file per day named
//! after `LogConfig::file_prefix`.

use anyhow::{Context, Result};
use dmxflow_core::LogConfig;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    filter::EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, Layer,
};

/// Keeps the non-blocking file writer flushing until dropped
pub struct LogGuard {
    _guard: WorkerGuard,
}

/// Daily rolling appender for the configured directory and prefix
pub fn file_appender(config: &LogConfig) -> Result<RollingFileAppender> {
    config
        .ensure_log_directory()
        .context("Failed to create log directory")?;

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(config.file_prefix.as_str())
        .filename_suffix("log")
        .max_log_files(config.max_log_files.max(1))
        .build(&config.log_dir)
        .with_context(|| format!("Failed to open log directory {:?}", config.log_dir))
}

/// Install the global subscriber
pub fn init(config: &LogConfig) -> Result<Option<LogGuard>> {
    if config.file_output {
        if let Err(e) = config.cleanup_old_logs() {
            eprintln!("Warning: failed to clean up old log files: {}", e);
        }
    }

    // RUST_LOG wins over --log-level
    let filter = EnvFilter::builder()
        .with_default_directive(config.parse_level().into())
        .from_env_lossy();

    let console_layer = config.console_output.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(filter.clone())
    });

    let (file_layer, guard) = if config.file_output {
        let (writer, worker_guard) = tracing_appender::non_blocking(file_appender(config)?);
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_thread_names(true)
            .with_filter(filter);
        (Some(layer), Some(LogGuard { _guard: worker_guard }))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();

    tracing::debug!("Logging at level {}", config.level);
    if config.file_output {
        tracing::info!("Writing logs to {:?}", config.current_log_path());
    }

    Ok(guard)
}
