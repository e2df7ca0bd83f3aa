//! Agent Core
//!
//! Process bootstrap shared by brokers, agents and clients: error handling,
//! configuration, and logging setup.

pub mod config;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use config::{load_config, load_config_or_default, AgentSettings, BrokerSettings, BusConfig, LoggingConfig};
pub use error::{AgentError, Result};
pub use logging::init_logging;
