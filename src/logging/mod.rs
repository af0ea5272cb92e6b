// Structured logging setup for binaries
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, Span};
use tracing_subscriber::{
    fmt::time::UtcTime,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter, Registry,
};

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub enable_colors: bool,
    pub enable_timestamps: bool,
    pub enable_line_numbers: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Compact,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            enable_colors: true,
            enable_timestamps: true,
            enable_line_numbers: false,
        }
    }
}

/// Logging manager
pub struct LoggingManager {
    config: LoggingConfig,
}

impl LoggingManager {
    pub fn new(config: LoggingConfig) -> Self {
        Self { config }
    }

    /// Install the global subscriber. `RUST_LOG` wins over the configured
    /// level. Fails if a subscriber is already installed.
    pub fn initialize(&self) -> Result<(), TryInitError> {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.config.level));

        let layer = tracing_subscriber::fmt::layer()
            .with_ansi(self.config.enable_colors)
            .with_line_number(self.config.enable_line_numbers);

        match (self.config.format, self.config.enable_timestamps) {
            (LogFormat::Text, true) => Registry::default()
                .with(filter)
                .with(layer.with_timer(UtcTime::rfc_3339()))
                .try_init()?,
            (LogFormat::Text, false) => Registry::default()
                .with(filter)
                .with(layer.without_time())
                .try_init()?,
            (LogFormat::Compact, true) => Registry::default()
                .with(filter)
                .with(layer.compact().with_timer(UtcTime::rfc_3339()))
                .try_init()?,
            (LogFormat::Compact, false) => Registry::default()
                .with(filter)
                .with(layer.compact().without_time())
                .try_init()?,
        }

        info!("Logging system initialized with level: {}", self.config.level);
        Ok(())
    }
}

/// Span that tags everything one cache instance logs with its name.
pub fn instance_span(name: &str) -> Span {
    info_span!("ipcache", name = %name)
}
