//! Configuration management for the agent bus
//!
//! Configuration is loaded from multiple sources:
//! - Default values
//! - Configuration files (TOML, JSON, YAML)
//! - Environment variables prefixed with `BUS__` (e.g. `BUS__AGENT__REQUEST_TIMEOUT_MS`)

use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for brokers and agents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Broker settings (channel naming, context lifetime)
    #[serde(default)]
    pub broker: BrokerSettings,

    /// Agent runtime settings
    #[serde(default)]
    pub agent: AgentSettings,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Use JSON format
    #[serde(default)]
    pub json: bool,
}

/// Broker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSettings {
    /// Prefix for directed channels (`{prefix}:{agent_id}`)
    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,

    /// Reserved channel every agent listens on for broadcasts
    #[serde(default = "default_broadcast_channel")]
    pub broadcast_channel: String,

    /// TTL applied to contexts created without an explicit one.
    /// `None` means contexts never expire on their own.
    #[serde(default = "default_context_ttl")]
    pub default_context_ttl_secs: Option<u64>,

    /// How often the background sweeper purges expired contexts
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

/// Agent runtime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Default timeout for `send_request`
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Upper bound on handlers running at once per agent
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_handlers: usize,

    /// How long `stop()` waits for in-flight handlers before aborting them
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_channel_prefix() -> String {
    "agent".to_string()
}

fn default_broadcast_channel() -> String {
    "agent:broadcast".to_string()
}

fn default_context_ttl() -> Option<u64> {
    Some(3600)
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_request_timeout() -> u64 {
    30_000
}

fn default_max_in_flight() -> usize {
    64
}

fn default_shutdown_grace() -> u64 {
    5_000
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            channel_prefix: default_channel_prefix(),
            broadcast_channel: default_broadcast_channel(),
            default_context_ttl_secs: default_context_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl BrokerSettings {
    pub fn default_context_ttl(&self) -> Option<Duration> {
        self.default_context_ttl_secs.map(Duration::from_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout(),
            max_in_flight_handlers: default_max_in_flight(),
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

impl AgentSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Load configuration from a file
///
/// Supports TOML, JSON, and YAML formats based on file extension.
/// Environment variables with the `BUS` prefix override file values.
///
/// # Example
///
/// ```no_run
/// use agent_core::config::load_config;
///
/// let config = load_config("bus.toml").unwrap();
/// println!("Broadcast channel: {}", config.broker.broadcast_channel);
/// ```
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<BusConfig> {
    let path = path.as_ref();

    if !path.exists() {
        return Err(AgentError::config(format!(
            "Config file not found: {}",
            path.display()
        )));
    }

    let settings = config::Config::builder()
        .add_source(config::File::from(path))
        .add_source(config::Environment::with_prefix("BUS").separator("__"))
        .build()?;

    let config: BusConfig = settings.try_deserialize()?;
    config.validate()?;

    tracing::info!("Configuration loaded from {}", path.display());

    Ok(config)
}

/// Load configuration with defaults if the file doesn't exist or is invalid
pub fn load_config_or_default<P: AsRef<Path>>(path: P) -> BusConfig {
    match load_config(path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            BusConfig::default()
        }
    }
}

impl BusConfig {
    /// Reject settings the runtime cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.broker.channel_prefix.is_empty() {
            return Err(AgentError::config("broker.channel_prefix must not be empty"));
        }
        if self.broker.broadcast_channel.is_empty() {
            return Err(AgentError::config("broker.broadcast_channel must not be empty"));
        }
        if self.agent.max_in_flight_handlers == 0 {
            return Err(AgentError::config(
                "agent.max_in_flight_handlers must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = BusConfig::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.broker.broadcast_channel, "agent:broadcast");
        assert_eq!(config.broker.default_context_ttl_secs, Some(3600));
        assert_eq!(config.agent.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.agent.max_in_flight_handlers, 64);
    }

    #[test]
    fn test_config_from_json_with_missing_sections() {
        let json = r#"{
            "logging": { "level": "debug", "json": true },
            "agent": { "request_timeout_ms": 250 }
        }"#;

        let config: BusConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
        assert_eq!(config.agent.request_timeout_ms, 250);
        assert_eq!(config.agent.shutdown_grace_ms, 5_000);
        assert_eq!(config.broker.channel_prefix, "agent");
    }

    #[test]
    fn test_null_ttl_means_no_expiry() {
        let json = r#"{ "broker": { "default_context_ttl_secs": null } }"#;
        let config: BusConfig = serde_json::from_str(json).unwrap();
        assert!(config.broker.default_context_ttl().is_none());
    }

    #[test]
    fn test_load_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[broker]\nbroadcast_channel = \"hr:broadcast\"\nsweep_interval_secs = 5\n\n[agent]\nmax_in_flight_handlers = 8"
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.broker.broadcast_channel, "hr:broadcast");
        assert_eq!(config.broker.sweep_interval(), Duration::from_secs(5));
        assert_eq!(config.agent.max_in_flight_handlers, 8);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[agent]\nmax_in_flight_handlers = 0").unwrap();

        let result = load_config(file.path());
        assert!(matches!(result, Err(AgentError::Config(_))));
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = load_config("nonexistent.toml");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_or_default() {
        let config = load_config_or_default("nonexistent.toml");
        assert_eq!(config.broker.channel_prefix, "agent");
    }
}
