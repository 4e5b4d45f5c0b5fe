use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

const LOG_FILE_PREFIX: &str = "offline-agent.log";

/// Install the global tracing subscriber.
///
/// Logs go to stderr, or to a daily-rotated file when `config.dir` is set.
/// RUST_LOG takes precedence over the configured level. The returned guard
/// must be held until exit so buffered file output is flushed.
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>> {
  let level: LevelFilter = config
    .level
    .parse()
    .map_err(|e| eyre!("Invalid log level '{}': {}", config.level, e))?;

  let filter = EnvFilter::builder()
    .with_default_directive(level.into())
    .from_env_lossy();

  match &config.dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
      let (writer, guard) = tracing_appender::non_blocking(appender);

      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

      Ok(None)
    }
  }
}
