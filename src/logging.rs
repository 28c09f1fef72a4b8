//! File logging for the CLI.

use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Filter variable; falls back to `draftcache=info`, or debug with `--verbose`.
pub const LOG_ENV: &str = "DRAFTCACHE_LOG";

pub fn log_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;
  Ok(data_dir.join("draftcache").join("logs"))
}

/// Install a subscriber writing to a daily-rolling file. Keep the guard alive
/// until exit or buffered lines are lost.
pub fn init(verbose: bool) -> Result<WorkerGuard> {
  let dir = log_dir()?;
  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&dir, "draftcache.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| {
    if verbose {
      EnvFilter::new("draftcache=debug")
    } else {
      EnvFilter::new("draftcache=info")
    }
  });

  let file_layer = tracing_subscriber::fmt::layer()
    .with_writer(writer)
    .with_ansi(false)
    .with_target(true);

  tracing_subscriber::registry()
    .with(filter)
    .with(file_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to initialise logging: {}", e))?;

  tracing::info!(path = %dir.display(), "logging initialised");
  Ok(guard)
}
