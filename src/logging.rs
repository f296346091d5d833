//! Tracing set-up for the peer binary
//!
//! Everything goes to a daily-rolling file in the recorder's log directory
//! and to stderr. `RUST_LOG` filters both; the directory can be moved with
//! `TANDEM_RECORDER_LOG_PATH`.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::debug;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_PREFIX: &str = "tandem-recorder.log";
const LOG_DIR_ENV: &str = "TANDEM_RECORDER_LOG_PATH";
const LOG_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Install the global subscriber. The returned guard flushes the file
/// writer on drop and must outlive every log call.
pub fn init_logging() -> Result<WorkerGuard> {
    let dir = log_dir(std::env::var_os(LOG_DIR_ENV))?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create log directory {:?}", dir))?;
    let pruned = prune_old_logs(&dir, LOG_MAX_AGE);

    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX));
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .context("Failed to install tracing subscriber")?;

    debug!("Logging to {:?} ({} old log files removed)", dir, pruned);
    Ok(guard)
}

/// Log directory: the override if given, else the platform state/data dir
fn log_dir(override_dir: Option<OsString>) -> Result<PathBuf> {
    if let Some(dir) = override_dir.filter(|dir| !dir.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    let dirs = ProjectDirs::from("dev", "tandem", "recorder")
        .context("Failed to determine project directories for logs")?;
    let base = dirs.state_dir().unwrap_or_else(|| dirs.data_local_dir());
    Ok(base.join("logs"))
}

/// Remove recorder log files older than `max_age`; returns how many went
fn prune_old_logs(dir: &Path, max_age: Duration) -> usize {
    let (Ok(entries), Some(cutoff)) = (std::fs::read_dir(dir), SystemTime::now().checked_sub(max_age))
    else {
        return 0;
    };

    entries
        .flatten()
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX))
        })
        .filter(|entry| {
            entry
                .metadata()
                .is_ok_and(|meta| meta.is_file() && meta.modified().is_ok_and(|m| m < cutoff))
        })
        .filter(|entry| std::fs::remove_file(entry.path()).is_ok())
        .count()
}
