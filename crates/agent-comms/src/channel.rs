//! Channel naming
//!
//! Directed traffic for agent `id` travels on `{prefix}:{id}`; broadcasts use
//! one reserved channel. Anyone using the same convention can observe or
//! inject traffic.

use agent_core::BrokerSettings;
use serde::{Deserialize, Serialize};

use crate::Message;

/// Naming convention shared by every process on one broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelNames {
    prefix: String,
    broadcast: String,
}

impl ChannelNames {
    pub fn new(prefix: impl Into<String>, broadcast: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            broadcast: broadcast.into(),
        }
    }

    pub fn from_settings(settings: &BrokerSettings) -> Self {
        Self::new(&settings.channel_prefix, &settings.broadcast_channel)
    }

    /// Channel an agent listens on for directed traffic
    pub fn directed(&self, agent_id: &str) -> String {
        format!("{}:{}", self.prefix, agent_id)
    }

    pub fn broadcast(&self) -> &str {
        &self.broadcast
    }

    /// Where `message` must be published
    pub fn route(&self, message: &Message) -> String {
        match &message.receiver {
            Some(receiver) => self.directed(receiver),
            None => self.broadcast.clone(),
        }
    }
}

impl Default for ChannelNames {
    fn default() -> Self {
        Self::from_settings(&BrokerSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Payload;

    #[test]
    fn test_default_names() {
        let names = ChannelNames::default();
        assert_eq!(names.directed("scorer"), "agent:scorer");
        assert_eq!(names.broadcast(), "agent:broadcast");
    }

    #[test]
    fn test_route() {
        let names = ChannelNames::new("hr", "hr:all");
        let directed = Message::request("a", "b", "x", Payload::new());
        let broadcast = Message::event("a", "x", Payload::new());
        assert_eq!(names.route(&directed), "hr:b");
        assert_eq!(names.route(&broadcast), "hr:all");
    }
}
