//! Base error type shared by every crate of the agent bus

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors raised while bootstrapping a process (config, logging)
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration parsing errors
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] config::ConfigError),

    /// Logging could not be installed (usually a subscriber is already set)
    #[error("Logging setup failed: {0}")]
    Logging(String),
}

impl AgentError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = AgentError::config("test error");
        assert!(matches!(err, AgentError::Config(_)));
        assert_eq!(err.to_string(), "Configuration error: test error");
    }

    #[test]
    fn test_error_from_config_parse() {
        let err = AgentError::from(config::ConfigError::NotFound("broker".into()));
        assert!(matches!(err, AgentError::ConfigParse(_)));
    }
}
