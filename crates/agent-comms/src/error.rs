//! Error types for agent communication

use agent_core::AgentError;

use crate::context::ContextStatus;

/// Result type for communication operations
pub type Result<T> = std::result::Result<T, CommsError>;

/// Errors in agent communication
#[derive(Debug, thiserror::Error)]
pub enum CommsError {
    /// Backing transport or store cannot be reached. Never retried here.
    #[error("Broker unreachable: {0}")]
    Connectivity(String),

    /// Context missing or expired
    #[error("Context not found: {0}")]
    ContextNotFound(String),

    /// Versioned update lost against a concurrent writer
    #[error("Context {context_id} changed concurrently (expected version {expected}, found {found})")]
    ContextConflict {
        context_id: String,
        expected: u64,
        found: u64,
    },

    /// Terminal contexts cannot change status again
    #[error("Context {context_id} cannot move from {from} to {to}")]
    InvalidStatusTransition {
        context_id: String,
        from: ContextStatus,
        to: ContextStatus,
    },

    /// Message breaks an envelope invariant
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Bad glob pattern for list operations
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Generic error from agent-core
    #[error(transparent)]
    CoreError(#[from] AgentError),
}

impl CommsError {
    /// Create a connectivity error
    pub fn connectivity<S: Into<String>>(msg: S) -> Self {
        Self::Connectivity(msg.into())
    }

    /// Create a transport error
    pub fn transport<S: Into<String>>(msg: S) -> Self {
        Self::Transport(msg.into())
    }

    /// Create an invalid message error
    pub fn invalid_message<S: Into<String>>(msg: S) -> Self {
        Self::InvalidMessage(msg.into())
    }

    /// Whether the failure came from the backing transport being down
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity(_))
    }
}
