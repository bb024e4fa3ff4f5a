use color_eyre::eyre::eyre;
use color_eyre::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "novelcache.log";

/// Install the global tracing subscriber.
///
/// Level precedence: `override_level`, then `RUST_LOG`, then the configured level. When a log
/// directory is configured a daily-rolling file layer is added; keep the returned guard alive
/// until exit so buffered lines get flushed.
pub fn init(logging: &LoggingConfig, override_level: Option<&str>) -> Result<Option<WorkerGuard>> {
  let env_filter = match override_level {
    Some(level) => EnvFilter::try_new(level)?,
    None => match EnvFilter::try_from_default_env() {
      Ok(filter) => filter,
      Err(_) => EnvFilter::try_new(&logging.level)?,
    },
  };

  let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(true);

  let (file_layer, guard) = match &logging.directory {
    Some(dir) => {
      std::fs::create_dir_all(dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
      let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = fmt::layer().with_writer(writer).with_ansi(false);
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(env_filter)
    .with(stderr_layer)
    .with(file_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  Ok(guard)
}
