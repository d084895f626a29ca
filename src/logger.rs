//! Logging setup and log-file retention.
//!
//! Initialises `tracing` with two sinks: stdout and a per-process file under
//! `logger.base_path`. `RUST_LOG` takes priority over the configured level,
//! matching the usual operator workflow. A sweeper task removes log files
//! older than the configured archive period.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggerConfig;

/// How often the sweeper looks for aged log files.
const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Errors raised during logger setup or sweeping.
#[derive(Debug, Error)]
pub enum LoggerError {
    /// The log directory could not be created.
    #[error("cannot create log directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The log file could not be opened.
    #[error("cannot open log file {path}: {source}")]
    OpenFile {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Scanning the log directory failed.
    #[error("cannot scan log directory {path}: {source}")]
    Scan {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Maps a configured level to a tracing directive.
fn level_directive(level: &str) -> &'static str {
    match level {
        "DEBUG" => "debug",
        "WARNING" => "warn",
        "ERROR" => "error",
        _ => "info",
    }
}

/// Initialises the global subscriber and returns the opened log file path.
///
/// The base path is created when absent; failure to create it is a startup
/// error. `RUST_LOG` overrides the configured level when set.
pub fn init(config: &LoggerConfig) -> Result<PathBuf, LoggerError> {
    fs::create_dir_all(&config.base_path).map_err(|source| LoggerError::CreateDir {
        path: config.base_path.clone(),
        source,
    })?;

    let file_name = format!("jobforge-{}.log", Utc::now().format("%Y%m%dT%H%M%S"));
    let file_path = config.base_path.join(file_name);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&file_path)
        .map_err(|source| LoggerError::OpenFile {
            path: file_path.clone(),
            source,
        })?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_directive(&config.level)));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        .with(filter)
        .init();

    Ok(file_path)
}

/// Deletes `.log` files in `dir` whose modification time is older than
/// `retention`. Returns the number of files removed.
pub fn sweep_aged_logs(dir: &Path, retention: Duration) -> Result<usize, LoggerError> {
    let entries = fs::read_dir(dir).map_err(|source| LoggerError::Scan {
        path: dir.to_path_buf(),
        source,
    })?;

    let cutoff = SystemTime::now() - retention;
    let mut removed = 0;

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }

        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot stat log file, skipping");
                continue;
            }
        };

        if modified < cutoff {
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), "Removed aged log file");
                    removed += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Cannot remove aged log file");
                }
            }
        }
    }

    Ok(removed)
}

/// Spawns the retention sweeper.
///
/// Runs one sweep immediately, then hourly, until the shutdown signal
/// fires. The retention window is `archive_period` hours.
pub fn spawn_sweeper(
    base_path: PathBuf,
    archive_period_hours: u64,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    let retention = Duration::from_secs(archive_period_hours * 3600);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match sweep_aged_logs(&base_path, retention) {
                        Ok(0) => {}
                        Ok(n) => info!(removed = n, "Log sweeper removed aged files"),
                        Err(e) => warn!(error = %e, "Log sweep failed"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("Log sweeper stopped");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    fn touch_with_age(dir: &Path, name: &str, age: Duration) -> PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).expect("create file");
        file.write_all(b"log line\n").expect("write");
        file.set_modified(SystemTime::now() - age)
            .expect("set mtime");
        path
    }

    #[test]
    fn test_sweeper_removes_old_logs() {
        let dir = tempfile::tempdir().expect("temp dir");
        let old = touch_with_age(dir.path(), "old.log", Duration::from_secs(2 * 3600));
        let fresh = touch_with_age(dir.path(), "fresh.log", Duration::from_secs(60));

        let removed =
            sweep_aged_logs(dir.path(), Duration::from_secs(3600)).expect("sweep succeeds");

        assert_eq!(removed, 1);
        assert!(!old.exists());
        assert!(fresh.exists());
    }

    #[test]
    fn test_sweeper_ignores_non_log_files() {
        let dir = tempfile::tempdir().expect("temp dir");
        let other = touch_with_age(dir.path(), "data.txt", Duration::from_secs(10 * 3600));

        let removed = sweep_aged_logs(dir.path(), Duration::from_secs(3600)).expect("sweep");

        assert_eq!(removed, 0);
        assert!(other.exists());
    }

    #[test]
    fn test_sweep_on_missing_dir_errors() {
        let result = sweep_aged_logs(Path::new("/nonexistent/jobforge"), Duration::from_secs(1));
        assert!(matches!(result, Err(LoggerError::Scan { .. })));
    }

    #[test]
    fn test_level_directives() {
        assert_eq!(level_directive("DEBUG"), "debug");
        assert_eq!(level_directive("INFO"), "info");
        assert_eq!(level_directive("WARNING"), "warn");
        assert_eq!(level_directive("ERROR"), "error");
    }
}
