//! Tracing setup for applications embedding the SDK.
//!
//! The SDK itself only emits `tracing` events; nothing is printed unless the
//! host installs a subscriber, either its own or one of the presets here.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Output preset for [`init_logging`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// Install nothing
    Silent,
    /// Compact human-readable lines on stderr
    Development,
    /// Pretty output with thread ids and source locations
    Debug,
    /// One JSON object per event, for log shippers
    Json,
}

impl LoggingMode {
    /// Parse the value of `OCF_LOG_MODE`. Unknown values map to `None`.
    pub fn from_env_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "silent" | "off" => Some(LoggingMode::Silent),
            "development" | "dev" => Some(LoggingMode::Development),
            "debug" => Some(LoggingMode::Debug),
            "json" => Some(LoggingMode::Json),
            _ => None,
        }
    }

    fn default_level(&self) -> &'static str {
        match self {
            LoggingMode::Debug => "debug",
            _ => "info",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to initialize tracing subscriber: {0}")]
    TracingInit(String),

    #[error("invalid log filter {filter:?}: {reason}")]
    InvalidFilter { filter: String, reason: String },
}

/// Install a global subscriber for `mode`.
///
/// Level selection reads `OCF_LOG_LEVEL`, then `RUST_LOG`, then falls back
/// to the mode's default. Fails if a global subscriber is already set.
pub fn init_logging(mode: LoggingMode) -> Result<(), LoggingError> {
    let init = |result: Result<(), tracing_subscriber::util::TryInitError>| {
        result.map_err(|e| LoggingError::TracingInit(e.to_string()))
    };

    match mode {
        LoggingMode::Silent => Ok(()),
        LoggingMode::Development => {
            let filter = create_env_filter(mode.default_level())?;
            init(
                Registry::default()
                    .with(fmt::layer().with_target(false).compact())
                    .with(filter)
                    .try_init(),
            )
        }
        LoggingMode::Debug => {
            let filter = create_env_filter(mode.default_level())?;
            init(
                Registry::default()
                    .with(
                        fmt::layer()
                            .pretty()
                            .with_thread_ids(true)
                            .with_file(true)
                            .with_line_number(true),
                    )
                    .with(filter)
                    .try_init(),
            )
        }
        LoggingMode::Json => {
            let filter = create_env_filter(mode.default_level())?;
            init(
                Registry::default()
                    .with(fmt::layer().json().with_current_span(true))
                    .with(filter)
                    .try_init(),
            )
        }
    }
}

/// Initialize from `OCF_LOG_MODE`, defaulting to [`LoggingMode::Silent`].
pub fn init_logging_from_env() -> Result<(), LoggingError> {
    let mode = std::env::var("OCF_LOG_MODE")
        .ok()
        .and_then(|v| LoggingMode::from_env_value(&v))
        .unwrap_or(LoggingMode::Silent);
    init_logging(mode)
}

fn create_env_filter(default_level: &str) -> Result<EnvFilter, LoggingError> {
    let directives = std::env::var("OCF_LOG_LEVEL")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| default_level.to_string());

    EnvFilter::try_new(&directives).map_err(|e| LoggingError::InvalidFilter {
        filter: directives,
        reason: e.to_string(),
    })
}

pub fn is_initialized() -> bool {
    tracing::dispatcher::has_been_set()
}
