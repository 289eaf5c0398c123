//! # Logging
//!
//! Installs the global `tracing` subscriber from a [`LoggingConfig`].
//!
//! Libraries usually leave this to the binary. It is here so a server built on
//! the crate can honour the `[logging]` section of its config file with one call.

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};

/// Install a fmt subscriber at the configured level, plain or JSON.
///
/// # Errors
/// Returns `Custom` if a global subscriber is already set.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_target(true);

    let installed = if config.json_format {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| ProtocolError::Custom(format!("Logging already initialised: {e}")))?;
    tracing::info!(app = %config.app_name, level = %config.log_level, "Logging initialised");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_an_error_not_a_panic() {
        let config = LoggingConfig::default();
        let _ = init_logging(&config);
        assert!(init_logging(&config).is_err());
    }
}
