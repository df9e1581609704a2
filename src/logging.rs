//! Logging setup
//!
//! Installs a `tracing-subscriber` fmt subscriber. `RUST_LOG` wins over the
//! configured level when set. Output goes to stderr so stdout stays free for
//! command output.

use crate::config::LoggingConfig;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Failed to install tracing subscriber: {0}")]
    Install(String),
}

/// Build the filter: `RUST_LOG` if present, otherwise the configured level
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_lowercase()))
}

/// Install the global subscriber
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_target(true)
        .with_thread_names(true)
        .with_writer(std::io::stderr);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| LoggingError::Install(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        let config = LoggingConfig::default();
        let _ = init_logging(&config);
        assert!(matches!(
            init_logging(&config),
            Err(LoggingError::Install(_))
        ));
    }
}
