use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Build the filter: `RUST_LOG` when set, otherwise the configured level.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| anyhow!("invalid logging.level '{}': {e}", config.level)),
    }
}

/// Install the global fmt subscriber. Safe to call more than once.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = env_filter(config)?;
    // A subscriber may already be installed (tests, embedding).
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.ansi)
        .with_target(true)
        .try_init();
    Ok(())
}
