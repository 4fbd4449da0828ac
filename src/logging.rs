//! Tracing setup for the `ldc` binary.
//!
//! Logs go to a daily rolling file in the data directory. With `verbose` they
//! are mirrored to stderr, so stdout stays reserved for command output.

use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::config::{Config, LogConfig};

const LOG_FILE_PREFIX: &str = "ldc.log";
const FILTER_ENV: &str = "LDC_LOG";
const DEFAULT_FILTER: &str = "info";

/// Keeps the background log writer alive. Dropping it flushes pending lines.
pub struct LogGuard {
  _guard: WorkerGuard,
}

/// Directives from `LDC_LOG`, then the config file, then `info`.
fn filter_directives(config: &LogConfig, env: Option<String>) -> String {
  env
    .filter(|value| !value.trim().is_empty())
    .or_else(|| config.filter.clone())
    .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}

fn log_directory(config: &LogConfig) -> Result<PathBuf> {
  match &config.directory {
    Some(dir) => Ok(dir.clone()),
    None => Config::data_dir(),
  }
}

fn file_layer(dir: &Path) -> (Box<dyn Layer<Registry> + Send + Sync>, WorkerGuard) {
  let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
  let (writer, guard) = tracing_appender::non_blocking(appender);
  let layer = tracing_subscriber::fmt::layer()
    .with_writer(writer)
    .with_ansi(false)
    .with_target(true);
  (Box::new(layer), guard)
}

fn stderr_layer() -> Box<dyn Layer<Registry> + Send + Sync> {
  Box::new(
    tracing_subscriber::fmt::layer()
      .compact()
      .with_writer(std::io::stderr)
      .with_target(false),
  )
}

/// Install the global subscriber. Call once, early in `main`.
pub fn init(config: &LogConfig, verbose: bool) -> Result<LogGuard> {
  let directives = filter_directives(config, std::env::var(FILTER_ENV).ok());
  let filter = EnvFilter::try_new(&directives)
    .map_err(|e| eyre!("Invalid log filter {:?}: {}", directives, e))?;

  let dir = log_directory(config)?;
  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let (file, guard) = file_layer(&dir);
  let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = vec![file];
  if verbose {
    layers.push(stderr_layer());
  }
  layers.push(Box::new(filter));

  Registry::default()
    .with(layers)
    .try_init()
    .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;

  Ok(LogGuard { _guard: guard })
}
