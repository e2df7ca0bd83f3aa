//! Error types for the client facade

use agent_comms::CommsError;
use agent_core::AgentError;
use agent_runtime::RuntimeError;

/// Result type for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors surfaced to callers of [`AgentClient`](crate::AgentClient)
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Timeout, cancellation, or a broker failure while calling an agent
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// The agent answered with a failure payload
    #[error("{action} failed: {message}")]
    Business { action: String, message: String },

    /// The reply did not have the expected shape
    #[error("Could not decode reply to '{action}': {source}")]
    Decode {
        action: String,
        #[source]
        source: serde_json::Error,
    },

    /// A backing agent factory failed
    #[error("Agent spawn failed: {0}")]
    SpawnFailed(String),

    /// Generic error from agent-core
    #[error(transparent)]
    CoreError(#[from] AgentError),
}

impl ClientError {
    /// Create a business failure
    pub fn business<A: Into<String>, M: Into<String>>(action: A, message: M) -> Self {
        Self::Business {
            action: action.into(),
            message: message.into(),
        }
    }

    /// Create a spawn failed error
    pub fn spawn_failed<S: Into<String>>(msg: S) -> Self {
        Self::SpawnFailed(msg.into())
    }

    /// Whether the agent itself reported the failure
    pub fn is_business(&self) -> bool {
        matches!(self, Self::Business { .. })
    }
}

impl From<CommsError> for ClientError {
    fn from(err: CommsError) -> Self {
        Self::Runtime(RuntimeError::Comms(err))
    }
}
