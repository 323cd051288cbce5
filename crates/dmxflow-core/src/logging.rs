//! Logging configuration
//!
//! Describes where and how verbosely the host writes logs. The subscriber
//! itself is installed by the binary; this type only carries settings and the
//! log-file housekeeping.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::PathBuf;
use tracing::level_filters::LevelFilter;

/// Log output settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Level name: trace, debug, info, warn, error, off
    pub level: String,
    /// Log to stderr
    pub console_output: bool,
    /// Log to a file in `log_dir`
    pub file_output: bool,
    /// Directory for log files
    pub log_dir: PathBuf,
    /// Number of log files kept by `cleanup_old_logs`
    pub max_log_files: usize,
    /// Log file name prefix
    pub file_prefix: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            console_output: true,
            file_output: false,
            log_dir: dirs::data_local_dir()
                .map(|p| p.join("DMXFlow").join("logs"))
                .unwrap_or_else(|| PathBuf::from("logs")),
            max_log_files: 10,
            file_prefix: "dmxflow".to_string(),
        }
    }
}

impl LogConfig {
    /// Parse the level name, defaulting to INFO
    pub fn parse_level(&self) -> LevelFilter {
        self.level.parse().unwrap_or(LevelFilter::INFO)
    }

    /// Create the log directory if needed
    pub fn ensure_log_directory(&self) -> io::Result<()> {
        fs::create_dir_all(&self.log_dir)
    }

    /// Path of today's (UTC) log file, named like the daily rolling appender does
    /// (`<prefix>.<YYYY-MM-DD>.log`)
    pub fn current_log_path(&self) -> PathBuf {
        let date = Utc::now().format("%Y-%m-%d");
        self.log_dir
            .join(format!("{}.{}.log", self.file_prefix, date))
    }

    /// Remove the oldest log files beyond `max_log_files`.
    ///
    /// Returns the number of files removed.
    pub fn cleanup_old_logs(&self) -> io::Result<usize> {
        if !self.log_dir.exists() {
            return Ok(0);
        }

        let prefix = format!("{}.", self.file_prefix);
        let mut logs: Vec<PathBuf> = fs::read_dir(&self.log_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(&prefix) && n.ends_with(".log"))
                    .unwrap_or(false)
            })
            .collect();

        if logs.len() <= self.max_log_files {
            return Ok(0);
        }

        // Date-stamped names sort chronologically
        logs.sort();
        let excess = logs.len() - self.max_log_files;
        for path in &logs[..excess] {
            fs::remove_file(path)?;
        }
        Ok(excess)
    }
}
