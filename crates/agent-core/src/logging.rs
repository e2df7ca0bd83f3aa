//! Logging setup for bus processes
//!
//! Structured logging through `tracing`. `RUST_LOG` takes precedence over the
//! configured level.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{AgentError, Result};

/// Initialize logging for the process
///
/// Call once at startup. Returns an error if a global subscriber is already
/// installed.
///
/// # Example
///
/// ```
/// use agent_core::config::LoggingConfig;
/// use agent_core::logging::init_logging;
///
/// let config = LoggingConfig {
///     level: "debug".to_string(),
///     json: false,
/// };
/// init_logging(&config).ok();
/// ```
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let installed = if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty())
            .try_init()
    };
    installed.map_err(|e| AgentError::Logging(e.to_string()))?;

    tracing::info!("Logging initialized at level: {}", config.level);
    Ok(())
}
