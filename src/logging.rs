//! Structured logging setup.
//!
//! Grounded on `infrastructure/logging/logger.rs`: a `tracing-subscriber`
//! registry with either pretty or JSON formatting, optionally mirrored to a
//! rotating file via `tracing-appender`.

use anyhow::Result;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};

/// Holds the non-blocking writer guard alive for the process lifetime.
pub struct LoggerHandle {
    _guard: Option<WorkerGuard>,
}

pub fn init(config: &LoggingConfig) -> Result<LoggerHandle> {
    let level = parse_level(&config.level)?;
    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let guard = if let Some(log_dir) = &config.log_dir {
        let file_appender = rolling::daily(log_dir, "loom.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let file_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .with_line_number(true);

        match config.format {
            LogFormat::Json => {
                let stdout_layer = tracing_subscriber::fmt::layer().json().with_target(true);
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(file_layer)
                    .with(stdout_layer)
                    .init();
            }
            LogFormat::Pretty => {
                let stdout_layer = tracing_subscriber::fmt::layer().pretty().with_target(true);
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(file_layer)
                    .with(stdout_layer)
                    .init();
            }
        }
        Some(guard)
    } else {
        match config.format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(tracing_subscriber::fmt::layer().json().with_target(true))
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(tracing_subscriber::fmt::layer().pretty().with_target(true))
                    .init();
            }
        }
        None
    };

    tracing::info!(level = %config.level, format = ?config.format, "logging initialized");
    Ok(LoggerHandle { _guard: guard })
}

fn parse_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => anyhow::bail!("invalid log level: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_levels_case_insensitively() {
        assert!(matches!(parse_level("INFO"), Ok(Level::INFO)));
        assert!(matches!(parse_level("warn"), Ok(Level::WARN)));
        assert!(parse_level("bogus").is_err());
    }
}
