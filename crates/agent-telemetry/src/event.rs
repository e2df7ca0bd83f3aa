//! Telemetry event types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Events emitted by agents as traffic flows through them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelemetryEvent {
    /// Agent lifecycle events
    AgentStarted {
        agent_id: String,
        agent_type: String,
        timestamp: DateTime<Utc>,
    },

    AgentStopped {
        agent_id: String,
        /// Handlers aborted because they outlived the shutdown grace period
        aborted_handlers: usize,
        timestamp: DateTime<Utc>,
    },

    /// Inter-agent traffic
    MessageSent {
        agent_id: String,
        message_id: String,
        receiver: Option<String>,
        kind: String,
        action: String,
        timestamp: DateTime<Utc>,
    },

    MessageReceived {
        agent_id: String,
        message_id: String,
        sender: String,
        kind: String,
        action: String,
        timestamp: DateTime<Utc>,
    },

    /// A request got no answer in time
    RequestTimedOut {
        agent_id: String,
        message_id: String,
        receiver: String,
        action: String,
        timeout_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A response arrived after its request was given up on
    ResponseDropped {
        agent_id: String,
        correlation_id: String,
        sender: String,
        timestamp: DateTime<Utc>,
    },

    /// A directed message matched no handler
    DeadLetter {
        agent_id: String,
        message_id: String,
        sender: String,
        action: String,
        timestamp: DateTime<Utc>,
    },

    /// A handler returned an error or panicked
    HandlerFailed {
        agent_id: String,
        message_id: String,
        action: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl TelemetryEvent {
    /// Get the agent ID associated with this event
    pub fn agent_id(&self) -> &str {
        match self {
            Self::AgentStarted { agent_id, .. } => agent_id,
            Self::AgentStopped { agent_id, .. } => agent_id,
            Self::MessageSent { agent_id, .. } => agent_id,
            Self::MessageReceived { agent_id, .. } => agent_id,
            Self::RequestTimedOut { agent_id, .. } => agent_id,
            Self::ResponseDropped { agent_id, .. } => agent_id,
            Self::DeadLetter { agent_id, .. } => agent_id,
            Self::HandlerFailed { agent_id, .. } => agent_id,
        }
    }

    /// Get the timestamp of this event
    pub fn timestamp(&self) -> &DateTime<Utc> {
        match self {
            Self::AgentStarted { timestamp, .. } => timestamp,
            Self::AgentStopped { timestamp, .. } => timestamp,
            Self::MessageSent { timestamp, .. } => timestamp,
            Self::MessageReceived { timestamp, .. } => timestamp,
            Self::RequestTimedOut { timestamp, .. } => timestamp,
            Self::ResponseDropped { timestamp, .. } => timestamp,
            Self::DeadLetter { timestamp, .. } => timestamp,
            Self::HandlerFailed { timestamp, .. } => timestamp,
        }
    }

    // Convenience constructors
    pub fn agent_started(agent_id: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self::AgentStarted {
            agent_id: agent_id.into(),
            agent_type: agent_type.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn agent_stopped(agent_id: impl Into<String>, aborted_handlers: usize) -> Self {
        Self::AgentStopped {
            agent_id: agent_id.into(),
            aborted_handlers,
            timestamp: Utc::now(),
        }
    }

    pub fn dead_letter(
        agent_id: impl Into<String>,
        message_id: impl Into<String>,
        sender: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self::DeadLetter {
            agent_id: agent_id.into(),
            message_id: message_id.into(),
            sender: sender.into(),
            action: action.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn handler_failed(
        agent_id: impl Into<String>,
        message_id: impl Into<String>,
        action: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self::HandlerFailed {
            agent_id: agent_id.into(),
            message_id: message_id.into(),
            action: action.into(),
            error: error.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = TelemetryEvent::dead_letter("scorer", "m-1", "matcher", "rank");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "dead_letter");
        assert_eq!(json["action"], "rank");

        let back: TelemetryEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_agent_id_accessor() {
        let event = TelemetryEvent::handler_failed("parser", "m-2", "parse", "bad pdf");
        assert_eq!(event.agent_id(), "parser");
    }
}
