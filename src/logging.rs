//! Structured logging.
//!
//! Diagnostics are emitted as `tracing` events with consistent field names so
//! that pretty and JSON output carry the same context:
//!
//! - `path`: file being parsed or watched
//! - `job_id`: ingestion job
//! - `config_id`: watch configuration
//! - `collector_id`, `session_id`: collector protocol context
//! - `stage`: pipeline stage (`parse`, `dedup`, `persist`)
//!
//! Command results are printed on stdout by the CLI; everything else goes
//! through the subscriber installed here (stderr).

use serde::Deserialize;
use std::sync::OnceLock;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

static LOGGING_INITIALIZED: OnceLock<()> = OnceLock::new();

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// `[logging]` section of the config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Level filter (trace, debug, info, warn, error). `RUST_LOG` wins when set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    #[error("failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing_subscriber::util::TryInitError),
}

fn build_filter(level: &str) -> Result<EnvFilter, LogError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(level).map_err(|_| LogError::InvalidLevel(level.to_string()))
}

/// Install the global subscriber. Call once at startup.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if LOGGING_INITIALIZED.get().is_some() {
        return Err(LogError::AlreadyInitialized);
    }

    let filter = build_filter(&config.level)?;
    match config.format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .try_init()?,
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_current_span(false),
            )
            .try_init()?,
    }

    let _ = LOGGING_INITIALIZED.set(());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_rejected() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let err = build_filter("convo=notalevel").unwrap_err();
        assert!(matches!(err, LogError::InvalidLevel(_)));
    }

    #[test]
    fn test_format_deserializes_lowercase() {
        let cfg: LogConfig = toml::from_str("level = \"debug\"\nformat = \"json\"\n").unwrap();
        assert_eq!(cfg.format, LogFormat::Json);
        assert_eq!(cfg.level, "debug");
    }
}
