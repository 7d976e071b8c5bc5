//! Daemon logging.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: daemon diagnostics. Level comes from the
//!   resolved configuration and `RUST_LOG` overrides it. Output goes to stderr
//!   and to `<log_dir>/terraform-ci.log`.
//!
//! - **Run logs (`io/store`)**: provisioner output in `<state>/logs/<id>.log`.
//!   Always written, unaffected by the log level.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogLevel;

/// File name of the daemon log inside the log directory.
pub const LOG_FILE_NAME: &str = "terraform-ci.log";

/// Initialize the global tracing subscriber. Call once, at startup.
///
/// Returns the path of the daemon log file.
///
/// # Example
/// ```bash
/// RUST_LOG=tfci=trace,tower_http=debug terraform-ci ./infra
/// ```
pub fn init(level: LogLevel, log_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("create log directory {}", log_dir.display()))?;
    let log_path = log_dir.join(LOG_FILE_NAME);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("open log file {}", log_path.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_directive()));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .with(
            fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false),
        )
        .try_init()
        .context("install tracing subscriber")?;

    Ok(log_path)
}
