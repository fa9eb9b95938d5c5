//! Process-wide logging setup.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use crate::config::{LogFormat, LoggingConfig};
use crate::error::DistillError;

/// Builds the filter: `RUST_LOG` wins over the configured level.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter, DistillError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| {
            DistillError::Telemetry(format!("invalid log level '{}': {}", config.level, e))
        }),
    }
}

/// Installs the global subscriber and routes `log` records into it.
///
/// Fails when a subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), DistillError> {
    let filter = env_filter(config)?;

    let installed = match config.format {
        LogFormat::Json => {
            let subscriber = Registry::default().with(filter).with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
        LogFormat::Text => {
            let subscriber = Registry::default()
                .with(filter)
                .with(fmt::layer().with_target(true));
            tracing::subscriber::set_global_default(subscriber)
        }
    };
    installed.map_err(|e| DistillError::Telemetry(e.to_string()))?;

    tracing_log::LogTracer::init().map_err(|e| DistillError::Telemetry(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_configured_level_used_without_rust_log() {
        std::env::remove_var("RUST_LOG");
        let config = LoggingConfig {
            level: "distill=debug,warn".to_string(),
            format: LogFormat::Text,
        };
        let filter = env_filter(&config).unwrap();
        assert!(filter.to_string().contains("distill=debug"));
    }

    #[test]
    #[serial]
    fn test_invalid_level_rejected() {
        std::env::remove_var("RUST_LOG");
        let config = LoggingConfig {
            level: "distill=loud".to_string(),
            format: LogFormat::Json,
        };
        assert!(matches!(
            env_filter(&config),
            Err(DistillError::Telemetry(_))
        ));
    }
}
