//! Outstanding requests awaiting a correlated response

use agent_comms::Message;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::oneshot;

/// message_id of an outbound request -> its single-use resolver
#[derive(Clone, Default)]
pub(crate) struct PendingRequests {
    waiting: Arc<DashMap<String, oneshot::Sender<Message>>>,
}

impl PendingRequests {
    /// Track a request; the entry is removed when the returned guard drops
    pub(crate) fn register(&self, message_id: &str) -> PendingResponse {
        let (tx, rx) = oneshot::channel();
        self.waiting.insert(message_id.to_string(), tx);
        PendingResponse {
            message_id: message_id.to_string(),
            receiver: rx,
            waiting: Arc::clone(&self.waiting),
        }
    }

    /// Hand a response to whoever waits on `correlation_id`
    ///
    /// Returns the response back when nothing is waiting for it.
    pub(crate) fn resolve(&self, correlation_id: &str, response: Message) -> Option<Message> {
        match self.waiting.remove(correlation_id) {
            // A requester that gave up between lookup and send just drops it
            Some((_, tx)) => {
                let _ = tx.send(response);
                None
            }
            None => Some(response),
        }
    }

    /// Drop every resolver; waiters observe a closed channel
    pub(crate) fn cancel_all(&self) -> usize {
        let count = self.waiting.len();
        self.waiting.clear();
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.waiting.len()
    }
}

/// Receiving side of one pending request
pub(crate) struct PendingResponse {
    message_id: String,
    receiver: oneshot::Receiver<Message>,
    waiting: Arc<DashMap<String, oneshot::Sender<Message>>>,
}

impl PendingResponse {
    pub(crate) fn receiver(&mut self) -> &mut oneshot::Receiver<Message> {
        &mut self.receiver
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        // Covers timeouts and callers dropping the request future
        self.waiting.remove(&self.message_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_comms::Payload;

    fn request() -> Message {
        Message::request("a", "b", "ping", Payload::new())
    }

    #[tokio::test]
    async fn test_resolve_delivers_response() {
        let pending = PendingRequests::default();
        let req = request();
        let mut waiter = pending.register(&req.message_id);

        let resp = Message::create_response(&req, Payload::new(), "b");
        assert!(pending.resolve(&req.message_id, resp.clone()).is_none());
        assert_eq!(waiter.receiver().await.unwrap(), resp);
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn test_unmatched_response_is_returned() {
        let pending = PendingRequests::default();
        let req = request();
        let resp = Message::create_response(&req, Payload::new(), "b");
        assert!(pending.resolve(&req.message_id, resp).is_some());
    }

    #[test]
    fn test_guard_drop_removes_entry() {
        let pending = PendingRequests::default();
        let waiter = pending.register("m-1");
        assert_eq!(pending.len(), 1);
        drop(waiter);
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn test_cancel_all_closes_waiters() {
        let pending = PendingRequests::default();
        let mut waiter = pending.register("m-1");
        assert_eq!(pending.cancel_all(), 1);
        assert!(waiter.receiver().await.is_err());
    }
}
