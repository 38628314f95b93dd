//! tracing subscriber setup.
//!
//! One-shot modes log to stderr. The TUI owns the terminal, so it logs to a file
//! under the platform data directory instead.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "flowscale_cli=info";

fn filter(silent: bool) -> EnvFilter {
    if silent {
        return EnvFilter::new("error");
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

pub fn init_stderr(silent: bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(silent))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Where the TUI writes its log.
pub fn log_file_path() -> Option<PathBuf> {
    dirs::data_local_dir().map(|d| d.join("flowscale-cli").join("flowscale-cli.log"))
}

pub fn init_file() -> Result<PathBuf> {
    let path = log_file_path().context("no local data directory for the log file")?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create log directory {}", parent.display()))?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open log file {}", path.display()))?;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(false))
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .try_init();
    Ok(path)
}
