//! Logging setup for the lanwatch binary.
//!
//! `LANWATCH_LOG` takes an `EnvFilter` directive (`debug`,
//! `lanwatch=trace,tower_http=info`, ...). Falls back to `RUST_LOG`, then
//! `info`.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LoggingMode {
    /// Human-readable compact lines on stderr
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Failed to initialize tracing subscriber: {0}")]
    TracingInit(String),

    #[error("Invalid log filter {directive:?}: {message}")]
    InvalidFilter { directive: String, message: String },
}

pub fn init_logging(mode: LoggingMode) -> Result<(), LoggingError> {
    let filter = env_filter("info")?;

    match mode {
        LoggingMode::Pretty => Registry::default()
            .with(fmt::layer().with_target(true).compact())
            .with(filter)
            .try_init(),
        LoggingMode::Json => Registry::default()
            .with(fmt::layer().json().with_current_span(false))
            .with(filter)
            .try_init(),
    }
    .map_err(|e| LoggingError::TracingInit(e.to_string()))
}

fn env_filter(default_level: &str) -> Result<EnvFilter, LoggingError> {
    let directive = std::env::var("LANWATCH_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| default_level.to_string());

    EnvFilter::try_new(&directive).map_err(|e| LoggingError::InvalidFilter {
        directive,
        message: e.to_string(),
    })
}
