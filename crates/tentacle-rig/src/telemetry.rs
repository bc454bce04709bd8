//! Structured logging setup
//!
//! Environment variables:
//! - `RUST_LOG` - Log filter directive (default: "info")
//! - `LOG_FORMAT` - Output format: "json" or "pretty" (default: "pretty")
//! - `TEST_LOG` - If set, enables logs in tests

use serde::{Deserialize, Serialize};
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry, fmt};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per event
    Json,
    /// Human readable terminal output
    #[default]
    Pretty,
}

impl LogFormat {
    fn from_env() -> Self {
        match std::env::var("LOG_FORMAT").map(|v| v.to_ascii_lowercase()) {
            Ok(v) if v == "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Filter used when `RUST_LOG` is unset
    pub filter: String,
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        Self {
            format: LogFormat::from_env(),
            ..Self::default()
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }
}

/// Initialize logging from environment variables.
///
/// # Example
///
/// ```rust,no_run
/// tentacle_rig::telemetry::init_default("tentacle-rig");
/// tracing::info!("rig started");
/// ```
pub fn init_default(service: &str) {
    init_with_config(service, TelemetryConfig::from_env());
}

/// Initialize logging with explicit configuration.
///
/// Calling this twice is harmless; the first subscriber stays installed.
pub fn init_with_config(service: &str, config: TelemetryConfig) {
    // Redirect log crate to tracing
    let _ = LogTracer::init();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let result = match config.format {
        LogFormat::Json => {
            let subscriber = Registry::default().with(env_filter).with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
        LogFormat::Pretty => {
            let subscriber = Registry::default().with(env_filter).with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
    };
    match result {
        Ok(()) => tracing::info!(service, format = ?config.format, "logging initialized"),
        Err(_) => tracing::debug!(service, "global subscriber already installed"),
    }
}

/// Initialize logging for tests. Silent unless `TEST_LOG` is set.
pub fn init_test() {
    if std::env::var_os("TEST_LOG").is_none() {
        return;
    }

    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = LogTracer::init();

        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
        let subscriber = Registry::default()
            .with(env_filter)
            .with(fmt::layer().with_target(true).with_test_writer());
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = TelemetryConfig::default()
            .with_filter("tentacle_rig=debug")
            .with_format(LogFormat::Json);
        assert_eq!(config.filter, "tentacle_rig=debug");
        assert_eq!(config.format, LogFormat::Json);
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_with_config("rig-test", TelemetryConfig::default().with_filter("warn"));
        init_with_config("rig-test", TelemetryConfig::default());
        tracing::info!("still running");
    }
}
