//! Transport seam for publish/subscribe traffic

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::Result;

/// One frame delivered to a subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Channel the frame was published on
    pub channel: String,
    /// Serialized message
    pub data: String,
}

/// Receiving end of a subscriber's connection
///
/// Frames from every channel the subscriber joined arrive here, in the
/// order the transport delivered them.
#[derive(Debug)]
pub struct Inbox {
    subscriber_id: String,
    receiver: mpsc::UnboundedReceiver<Frame>,
}

impl Inbox {
    pub fn new(subscriber_id: impl Into<String>, receiver: mpsc::UnboundedReceiver<Frame>) -> Self {
        Self {
            subscriber_id: subscriber_id.into(),
            receiver,
        }
    }

    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    /// Next frame, or `None` once the transport closed this inbox
    pub async fn recv(&mut self) -> Option<Frame> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Frame> {
        self.receiver.try_recv().ok()
    }
}

/// Pub/sub transport used by the broker
///
/// Implementations decide HOW frames travel; the broker only names channels.
/// Every method fails fast with [`CommsError::Connectivity`](crate::CommsError)
/// when the transport is unreachable; nothing is buffered or retried.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Open (or reopen) the connection of a subscriber
    async fn open_inbox(&self, subscriber_id: &str) -> Result<Inbox>;

    /// Drop a subscriber's connection and all its channel memberships
    async fn close_inbox(&self, subscriber_id: &str) -> Result<()>;

    /// Join a channel; frames published there flow into the subscriber's inbox
    async fn subscribe(&self, subscriber_id: &str, channel: &str) -> Result<()>;

    /// Leave a channel
    async fn unsubscribe(&self, subscriber_id: &str, channel: &str) -> Result<()>;

    /// Fire-and-forget publish; returns how many subscribers got the frame
    async fn publish(&self, channel: &str, data: String) -> Result<usize>;

    /// Round-trip to the transport
    async fn ping(&self) -> Result<()>;

    /// Channels with at least one subscriber
    async fn channel_count(&self) -> Result<usize>;

    /// Total channel memberships
    async fn subscription_count(&self) -> Result<usize>;

    /// Get transport name
    fn name(&self) -> &str;
}
