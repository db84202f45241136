//! Logging Module
//!
//! Console logging is always on. Debug mode, or an explicit log directory,
//! adds a daily-rolling file; the returned guard must be held until shutdown
//! so buffered lines are flushed.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const LOG_FILE_PREFIX: &str = "whatsgate";

/// Logging setup, built up with the `with_*` methods.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub debug_mode: bool,
    pub log_dir: Option<PathBuf>,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self {
            level: "info".to_string(),
            debug_mode: false,
            log_dir: None,
            json: false,
        }
    }

    /// Debug mode raises the default level to `debug` and writes log files.
    pub fn with_debug_mode(mut self, debug: bool) -> Self {
        self.debug_mode = debug;
        self
    }

    pub fn with_log_dir(mut self, dir: PathBuf) -> Self {
        self.log_dir = Some(dir);
        self
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    /// Filter directive used when `RUST_LOG` is not set.
    fn directive(&self) -> &str {
        if self.debug_mode { "debug" } else { &self.level }
    }

    fn writes_files(&self) -> bool {
        self.debug_mode || self.log_dir.is_some()
    }

    fn resolved_log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(default_log_dir)
    }
}

/// Where log files go unless configured otherwise.
pub fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("whatsgate")
        .join("logs")
}

/// Keeps the file writer alive; drop it last.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber.
pub fn init_logging(config: LogConfig) -> Result<LogGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.directive()))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let (console_json, console_text) = if config.json {
        (Some(fmt::layer().json().with_target(true)), None)
    } else {
        (None, Some(fmt::layer().with_target(false)))
    };

    let (file_layer, guard) = if config.writes_files() {
        let dir = config.resolved_log_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
        let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_json)
        .with(console_text)
        .with(file_layer)
        .try_init()
        .context("Logging already initialized")?;

    if config.writes_files() {
        tracing::debug!(
            "Logging to {}",
            config.resolved_log_dir().display()
        );
    }

    Ok(LogGuard { _file: guard })
}

fn is_log_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(LOG_FILE_PREFIX))
}

/// Most recently written log file in `dir`.
pub fn newest_log_in(dir: &Path) -> Option<PathBuf> {
    std::fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| is_log_file(&entry.path()))
        .filter_map(|entry| {
            let modified = entry.metadata().ok()?.modified().ok()?;
            Some((modified, entry.path()))
        })
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, path)| path)
}

/// Remove log files older than `days` from the default directory.
pub fn cleanup_old_logs(days: u64) -> Result<usize> {
    cleanup_logs_in(&default_log_dir(), days)
}

pub fn cleanup_logs_in(dir: &Path, days: u64) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let max_age = Duration::from_secs(days * 24 * 60 * 60);
    let now = SystemTime::now();
    let mut removed = 0;

    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read log directory: {}", dir.display()))?
    {
        let path = entry?.path();
        if !is_log_file(&path) {
            continue;
        }
        let Ok(modified) = std::fs::metadata(&path).and_then(|m| m.modified()) else {
            continue;
        };
        if now.duration_since(modified).unwrap_or_default() > max_age {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    #[test]
    fn test_builder() {
        let config = LogConfig::new()
            .with_level("warn")
            .with_json(true)
            .with_log_dir(PathBuf::from("/tmp/wg-logs"));
        assert_eq!(config.directive(), "warn");
        assert!(config.json);
        assert_eq!(config.resolved_log_dir(), PathBuf::from("/tmp/wg-logs"));
    }

    #[test]
    fn test_debug_mode_overrides_level() {
        let config = LogConfig::new().with_level("error").with_debug_mode(true);
        assert_eq!(config.directive(), "debug");
        assert!(config.writes_files());
        assert!(!LogConfig::new().writes_files());
    }

    #[test]
    fn test_cleanup_keeps_recent_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("whatsgate.2026-10-16")).unwrap();
        File::create(dir.path().join("notes.txt")).unwrap();

        let removed = cleanup_logs_in(dir.path(), 7).unwrap();
        assert_eq!(removed, 0);
        assert!(dir.path().join("whatsgate.2026-10-16").exists());
    }

    #[test]
    fn test_cleanup_zero_days_removes_logs_only() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("whatsgate.2026-10-01")).unwrap();
        File::create(dir.path().join("notes.txt")).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let removed = cleanup_logs_in(dir.path(), 0).unwrap();
        assert_eq!(removed, 1);
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn test_cleanup_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(cleanup_logs_in(&dir.path().join("absent"), 7).unwrap(), 0);
    }

    #[test]
    fn test_newest_log() {
        let dir = tempfile::tempdir().unwrap();
        assert!(newest_log_in(dir.path()).is_none());
        File::create(dir.path().join("whatsgate.2026-10-16")).unwrap();
        assert_eq!(
            newest_log_in(dir.path()).unwrap(),
            dir.path().join("whatsgate.2026-10-16")
        );
    }
}
