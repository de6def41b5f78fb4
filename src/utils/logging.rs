//! Structured logging initialization.
//!
//! Thin wrapper over `tracing-subscriber`: level comes from the logging
//! config, `RUST_LOG` wins when set.

use crate::config::LoggingConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Safe to call more than once; only the
/// first call wins.
pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string().to_lowercase()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = if config.json_format {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    if installed.is_ok() {
        info!(app = %config.app_name, "logging initialized");
    }
}
