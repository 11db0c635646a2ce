use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use crate::config::LoggingConfig;

/// Initialize structured logging for the host process.
///
/// `RUST_LOG` wins over the configured level when set. JSON output is meant
/// for production ingestion; the pretty format is for development.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| anyhow::anyhow!("invalid log level {:?}: {e}", config.level))?;

    let registry = tracing_subscriber::registry().with(env_filter);

    if config.format.as_str() == "json" {
        let layer = fmt::layer().json().with_target(true);
        match &config.file_path {
            Some(path) => {
                let file = open_log_file(path)?;
                registry
                    .with(layer.with_writer(std::sync::Arc::new(file)))
                    .init();
            }
            None => registry.with(layer).init(),
        }
    } else {
        let layer = fmt::layer().pretty().with_target(true);
        match &config.file_path {
            Some(path) => {
                let file = open_log_file(path)?;
                registry
                    .with(layer.with_writer(std::sync::Arc::new(file)))
                    .init();
            }
            None => registry.with(layer).init(),
        }
    }

    Ok(())
}

fn open_log_file(path: &str) -> anyhow::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| anyhow::anyhow!("cannot open log file {path}: {e}"))
}
