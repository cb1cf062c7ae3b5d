use crate::{HubError, HubResult};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log severity threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        };
        f.write_str(s)
    }
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
    Compact,
}

/// Logging configuration for a hub service
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    pub include_thread_ids: bool,
    pub include_file_locations: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Compact,
            include_thread_ids: false,
            include_file_locations: false,
        }
    }
}

/// Initialize the tracing subscriber for a service.
///
/// `RUST_LOG` takes precedence over the configured level when set.
pub fn initialize_logging(config: LoggingConfig) -> HubResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string()));

    let fmt_layer = match config.format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_thread_ids(config.include_thread_ids)
            .with_file(config.include_file_locations)
            .with_line_number(config.include_file_locations)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_thread_ids(config.include_thread_ids)
            .with_file(config.include_file_locations)
            .with_line_number(config.include_file_locations)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_thread_ids(config.include_thread_ids)
            .with_file(config.include_file_locations)
            .with_line_number(config.include_file_locations)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| HubError::Configuration(format!("Logging initialization failed: {}", e)))?;

    Ok(())
}

/// Initialize logging with the default service configuration
pub fn initialize_default_logging() -> HubResult<()> {
    initialize_logging(LoggingConfig::default())
}
