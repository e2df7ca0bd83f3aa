//! Message envelope exchanged between agents
//!
//! A [`Message`] is immutable once built. The broker relays it without looking
//! at `action` or `payload`; dispatch is the receiver's business.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{CommsError, Result};

/// Open map of JSON primitives carried by a message or context
pub type Payload = Map<String, Value>;

/// Kind of message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Expects exactly one correlated response
    Request,

    /// Answer to a request, carries `correlation_id`
    Response,

    /// One-way message, directed or broadcast
    Notification,

    /// Something happened; always broadcast
    Event,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Notification => "notification",
            Self::Event => "event",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message between agents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub message_id: String,

    /// Sending agent ID
    pub sender: String,

    /// Receiving agent ID (None for broadcast)
    pub receiver: Option<String>,

    /// Message kind
    pub kind: MessageKind,

    /// Dispatch key on the receiving side
    pub action: String,

    /// Message payload
    pub payload: Payload,

    /// Workflow context this message belongs to
    #[serde(default)]
    pub context_id: Option<String>,

    /// For responses: the `message_id` of the request being answered
    #[serde(default)]
    pub correlation_id: Option<String>,

    /// Creation time
    pub timestamp: DateTime<Utc>,

    /// Free-form metadata
    #[serde(default)]
    pub metadata: Payload,
}

impl Message {
    fn build(
        sender: String,
        receiver: Option<String>,
        kind: MessageKind,
        action: String,
        payload: Payload,
    ) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            sender,
            receiver,
            kind,
            action,
            payload,
            context_id: None,
            correlation_id: None,
            timestamp: Utc::now(),
            metadata: Payload::new(),
        }
    }

    /// Create a request message
    pub fn request(
        sender: impl Into<String>,
        receiver: impl Into<String>,
        action: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self::build(
            sender.into(),
            Some(receiver.into()),
            MessageKind::Request,
            action.into(),
            payload,
        )
    }

    /// Create a notification; `None` receiver broadcasts it
    pub fn notification(
        sender: impl Into<String>,
        receiver: Option<String>,
        action: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self::build(
            sender.into(),
            receiver,
            MessageKind::Notification,
            action.into(),
            payload,
        )
    }

    /// Create a broadcast event
    pub fn event(sender: impl Into<String>, action: impl Into<String>, payload: Payload) -> Self {
        Self::build(sender.into(), None, MessageKind::Event, action.into(), payload)
    }

    /// Create the response to `original`
    ///
    /// The response goes back to the original sender, keeps the action and
    /// context, and carries the request's `message_id` as `correlation_id`.
    pub fn create_response(original: &Message, payload: Payload, sender: impl Into<String>) -> Self {
        let mut response = Self::build(
            sender.into(),
            Some(original.sender.clone()),
            MessageKind::Response,
            original.action.clone(),
            payload,
        );
        response.context_id = original.context_id.clone();
        response.correlation_id = Some(original.message_id.clone());
        response
    }

    /// Attach a workflow context
    pub fn with_context(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    /// Attach optional workflow context
    pub fn with_context_opt(mut self, context_id: Option<String>) -> Self {
        self.context_id = context_id;
        self
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// True when nobody in particular is addressed
    pub fn is_broadcast(&self) -> bool {
        self.receiver.is_none()
    }

    pub fn is_response(&self) -> bool {
        self.kind == MessageKind::Response
    }

    /// Check the envelope invariants
    ///
    /// - `correlation_id` is set iff the message is a response
    /// - requests and responses are directed, events are broadcast
    pub fn validate(&self) -> Result<()> {
        if self.message_id.is_empty() {
            return Err(CommsError::invalid_message("empty message_id"));
        }
        if self.sender.is_empty() {
            return Err(CommsError::invalid_message("empty sender"));
        }
        if matches!(&self.receiver, Some(r) if r.is_empty()) {
            return Err(CommsError::invalid_message("empty receiver"));
        }
        match (self.kind, self.correlation_id.is_some()) {
            (MessageKind::Response, false) => {
                return Err(CommsError::invalid_message("response without correlation_id"))
            }
            (kind, true) if kind != MessageKind::Response => {
                return Err(CommsError::invalid_message(format!(
                    "{} must not carry a correlation_id",
                    kind
                )))
            }
            _ => {}
        }
        match (self.kind, self.receiver.is_some()) {
            (MessageKind::Request | MessageKind::Response, false) => Err(
                CommsError::invalid_message(format!("{} must have a receiver", self.kind)),
            ),
            (MessageKind::Event, true) => {
                Err(CommsError::invalid_message("event must not have a receiver"))
            }
            _ => Ok(()),
        }
    }

    /// Serialize for the wire
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from the wire
    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }
}

/// Build a payload from a `json!` object literal; anything else yields an empty map
pub fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

/// Reply payload for a handler that succeeded
pub fn success_payload(result: Value) -> Payload {
    let mut map = Payload::new();
    map.insert("success".into(), Value::Bool(true));
    map.insert("result".into(), result);
    map
}

/// Reply payload for a handler that failed; requesters see it as a business error
pub fn failure_payload(error: impl std::fmt::Display) -> Payload {
    let mut map = Payload::new();
    map.insert("success".into(), Value::Bool(false));
    map.insert("error".into(), Value::String(error.to_string()));
    map
}

/// Error text if `payload` signals failure (`"success": false`)
pub fn failure_reason(payload: &Payload) -> Option<String> {
    match payload.get("success") {
        Some(Value::Bool(false)) => Some(
            payload
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unspecified failure")
                .to_string(),
        ),
        _ => None,
    }
}
