//! File logging. Stdout belongs to command output (tables, JSON), so tracing
//! goes only to `agentbox.log` under the state directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result, anyhow};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Holds the writer guard for the life of the process; set once on first init.
static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

const LOG_FILE_NAME: &str = "agentbox.log";

/// Filter directive variable checked before `RUST_LOG`.
pub const LOG_ENV: &str = "AGENTBOX_LOG";

const DEFAULT_FILTER: &str = "info";

pub fn init() -> Result<()> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let log_path = determine_log_path()?;
    let (directory, file_name) = split_path(&log_path)?;
    fs::create_dir_all(&directory)
        .with_context(|| format!("Failed to create log directory at {}", directory.display()))?;

    let (non_blocking, guard) =
        tracing_appender::non_blocking(rolling::never(&directory, file_name));

    tracing_subscriber::registry()
        .with(filter_from(
            std::env::var(LOG_ENV).ok(),
            std::env::var("RUST_LOG").ok(),
        ))
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false),
        )
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    let _ = GUARD.set(guard);
    Ok(())
}

/// First parseable directive wins: `AGENTBOX_LOG`, then `RUST_LOG`, then `info`.
fn filter_from(own: Option<String>, rust_log: Option<String>) -> EnvFilter {
    [own, rust_log]
        .into_iter()
        .flatten()
        .filter(|d| !d.trim().is_empty())
        .find_map(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

fn determine_log_path() -> Result<PathBuf> {
    match crate::registry::state_dir() {
        Ok(dir) => Ok(dir.join(LOG_FILE_NAME)),
        // No home directory to anchor the state dir
        Err(_) => Ok(std::env::current_dir()?.join(LOG_FILE_NAME)),
    }
}

fn split_path(path: &Path) -> Result<(PathBuf, &str)> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("Invalid log file name"))?;

    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    Ok((dir, file_name))
}
