//! Structured logging setup.
//!
//! The runtime logs through `tracing` with correlation fields on every record:
//! - `instance_id` - workflow instance identifier
//! - `activity_name` - activity being executed (executor records)
//! - `attempt` - 1-based attempt number (executor records)
//!
//! Installing a subscriber is optional. When [`RuntimeOptions::logging`] is set
//! the runtime calls [`init_logging`] at start and tolerates a subscriber that
//! is already installed (tests, multiple runtimes in one process).
//!
//! [`RuntimeOptions::logging`]: crate::runtime::RuntimeOptions::logging

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log format options for structured logging
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Structured JSON output for log aggregators
    Json,
    /// Human-readable format for development (with all fields)
    Pretty,
    /// Compact single-line format
    #[default]
    Compact,
}

/// Logging configuration.
///
/// ```rust,no_run
/// # use blobflow::runtime::observability::{LoggingConfig, LogFormat};
/// let config = LoggingConfig {
///     log_format: LogFormat::Json,
///     log_level: "debug".to_string(),
/// };
/// blobflow::runtime::observability::init_logging(&config).ok();
/// ```
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub log_format: LogFormat,
    /// Level for this crate's targets (e.g. "info", "debug"). Everything else logs at `warn`.
    pub log_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Compact,
            log_level: "info".to_string(),
        }
    }
}

fn default_filter_expression(level: &str) -> String {
    format!("warn,blobflow={level}")
}

/// Install a global subscriber. `RUST_LOG` takes precedence over `log_level`.
///
/// Returns `Err` if a global subscriber is already set.
pub fn init_logging(config: &LoggingConfig) -> Result<(), String> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter_expression(&config.log_level)));

    match config.log_format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .map_err(|e| format!("Failed to initialize JSON logging: {}", e))?;
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .try_init()
                .map_err(|e| format!("Failed to initialize pretty logging: {}", e))?;
        }
        LogFormat::Compact => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().compact())
                .try_init()
                .map_err(|e| format!("Failed to initialize compact logging: {}", e))?;
        }
    }

    Ok(())
}
