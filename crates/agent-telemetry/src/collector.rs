//! Telemetry collector

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::TelemetryEvent;

/// Telemetry collector for bus events
///
/// Broadcasts events to subscribers. Lossy: with no subscriber, or a
/// subscriber lagging behind `capacity`, events are dropped.
#[derive(Clone)]
pub struct TelemetryCollector {
    sender: Arc<broadcast::Sender<TelemetryEvent>>,
}

impl TelemetryCollector {
    /// Create a new telemetry collector
    ///
    /// # Arguments
    /// * `capacity` - Channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Emit a telemetry event to all current subscribers
    pub fn emit(&self, event: TelemetryEvent) {
        tracing::trace!(agent_id = event.agent_id(), event = ?event, "Telemetry event");

        // No receivers is fine
        let _ = self.sender.send(event);
    }

    /// Subscribe to telemetry events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for TelemetryCollector {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let collector = TelemetryCollector::new(100);
        let mut sub = collector.subscribe();

        collector.emit(TelemetryEvent::agent_started("agent-1", "scorer"));

        let received = sub.recv().await.unwrap();
        assert_eq!(received.agent_id(), "agent-1");
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let collector = TelemetryCollector::default();
        let mut sub1 = collector.subscribe();
        let mut sub2 = collector.subscribe();
        assert_eq!(collector.subscriber_count(), 2);

        collector.emit(TelemetryEvent::dead_letter("a", "m", "b", "x"));

        assert_eq!(sub1.recv().await.unwrap().agent_id(), "a");
        assert_eq!(sub2.recv().await.unwrap().agent_id(), "a");
    }

    #[test]
    fn test_no_subscribers_no_error() {
        let collector = TelemetryCollector::new(10);
        collector.emit(TelemetryEvent::agent_stopped("a", 0));
        assert_eq!(collector.subscriber_count(), 0);
    }
}
