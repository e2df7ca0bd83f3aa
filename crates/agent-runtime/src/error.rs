//! Error types for agent runtime

use std::time::Duration;

use agent_comms::CommsError;
use agent_core::AgentError;

/// Result type for agent runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors that can occur while an agent runs
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Broker, transport, or context store failure
    #[error(transparent)]
    Comms(#[from] CommsError),

    /// No correlated response arrived in time
    #[error("Request '{action}' timed out after {after:?}")]
    Timeout { action: String, after: Duration },

    /// The agent stopped while the request was pending
    #[error("Request cancelled: agent stopped")]
    Cancelled,

    /// Operation needs a running agent
    #[error("Agent {0} is not running")]
    NotRunning(String),

    /// start() called on an agent that was already started once
    #[error("Agent {0} was already started")]
    AlreadyStarted(String),

    /// Raised by a message handler
    #[error("Handler error: {0}")]
    Handler(String),

    /// Generic error from agent-core
    #[error(transparent)]
    CoreError(#[from] AgentError),
}

impl RuntimeError {
    /// Create a handler error
    pub fn handler<S: Into<String>>(msg: S) -> Self {
        Self::Handler(msg.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Comms(CommsError::Serialization(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display() {
        let err = RuntimeError::Timeout {
            action: "score".into(),
            after: Duration::from_millis(250),
        };
        assert_eq!(err.to_string(), "Request 'score' timed out after 250ms");
        assert!(err.is_timeout());
    }

    #[test]
    fn test_comms_error_is_transparent() {
        let err: RuntimeError = CommsError::connectivity("refused").into();
        assert_eq!(err.to_string(), "Broker unreachable: refused");
    }
}
