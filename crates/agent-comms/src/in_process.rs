//! In-process backend using Tokio channels and DashMap
//!
//! Frames still travel as serialized strings, so agents sharing this backend
//! exchange values, never references.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::{
    store::KeyValueStore,
    transport::{Frame, Inbox, MessageTransport},
    CommsError, Result,
};

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(value: String, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

fn compile_pattern(pattern: &str) -> Result<glob::Pattern> {
    glob::Pattern::new(pattern).map_err(|e| CommsError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// In-process pub/sub transport and key/value store
///
/// Cloning shares the same underlying state.
#[derive(Clone)]
pub struct InProcessBackend {
    /// Subscriber connections (subscriber_id -> sender)
    inboxes: Arc<DashMap<String, mpsc::UnboundedSender<Frame>>>,

    /// Channel memberships (channel -> subscriber IDs)
    channels: Arc<DashMap<String, HashSet<String>>>,

    /// Key/value records
    entries: Arc<DashMap<String, StoredValue>>,

    /// Simulated connectivity; when false every call fails fast
    reachable: Arc<AtomicBool>,
}

impl InProcessBackend {
    pub fn new() -> Self {
        Self {
            inboxes: Arc::new(DashMap::new()),
            channels: Arc::new(DashMap::new()),
            entries: Arc::new(DashMap::new()),
            reachable: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Toggle reachability, e.g. to exercise outage handling
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
        tracing::debug!(reachable, "In-process backend reachability changed");
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    fn ensure_reachable(&self) -> Result<()> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(CommsError::connectivity("in-process backend is offline"))
        }
    }

    /// Subscribers currently joined to `channel`
    pub fn subscribers(&self, channel: &str) -> Vec<String> {
        self.channels
            .get(channel)
            .map(|subs| subs.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for InProcessBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageTransport for InProcessBackend {
    async fn open_inbox(&self, subscriber_id: &str) -> Result<Inbox> {
        self.ensure_reachable()?;
        let (tx, rx) = mpsc::unbounded_channel();
        if self.inboxes.insert(subscriber_id.to_string(), tx).is_some() {
            tracing::debug!(subscriber_id, "Replaced existing inbox");
        }
        Ok(Inbox::new(subscriber_id, rx))
    }

    async fn close_inbox(&self, subscriber_id: &str) -> Result<()> {
        self.ensure_reachable()?;
        self.inboxes.remove(subscriber_id);
        self.channels.retain(|_, subs| {
            subs.remove(subscriber_id);
            !subs.is_empty()
        });
        tracing::debug!(subscriber_id, "Closed inbox");
        Ok(())
    }

    async fn subscribe(&self, subscriber_id: &str, channel: &str) -> Result<()> {
        self.ensure_reachable()?;
        if !self.inboxes.contains_key(subscriber_id) {
            return Err(CommsError::transport(format!(
                "no open inbox for subscriber {}",
                subscriber_id
            )));
        }
        self.channels
            .entry(channel.to_string())
            .or_default()
            .insert(subscriber_id.to_string());
        tracing::trace!(subscriber_id, channel, "Subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, subscriber_id: &str, channel: &str) -> Result<()> {
        self.ensure_reachable()?;
        let now_empty = match self.channels.get_mut(channel) {
            Some(mut subs) => {
                subs.remove(subscriber_id);
                subs.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.channels.remove_if(channel, |_, subs| subs.is_empty());
        }
        tracing::trace!(subscriber_id, channel, "Unsubscribed");
        Ok(())
    }

    async fn publish(&self, channel: &str, data: String) -> Result<usize> {
        self.ensure_reachable()?;
        let mut delivered = 0;
        for subscriber_id in self.subscribers(channel) {
            if let Some(tx) = self.inboxes.get(&subscriber_id) {
                let frame = Frame {
                    channel: channel.to_string(),
                    data: data.clone(),
                };
                if tx.send(frame).is_ok() {
                    delivered += 1;
                }
            }
        }
        tracing::trace!(channel, delivered, "Published frame");
        Ok(delivered)
    }

    async fn ping(&self) -> Result<()> {
        self.ensure_reachable()
    }

    async fn channel_count(&self) -> Result<usize> {
        self.ensure_reachable()?;
        Ok(self.channels.len())
    }

    async fn subscription_count(&self) -> Result<usize> {
        self.ensure_reachable()?;
        Ok(self.channels.iter().map(|subs| subs.len()).sum())
    }

    fn name(&self) -> &str {
        "in_process"
    }
}

#[async_trait]
impl KeyValueStore for InProcessBackend {
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        self.ensure_reachable()?;
        self.entries
            .insert(key.to_string(), StoredValue::new(value, ttl));
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        self.ensure_reachable()?;
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let matches = {
                    let stored = occupied.get();
                    let current = stored.is_live(now).then_some(stored.value.as_str());
                    current == expected
                };
                if matches {
                    occupied.insert(StoredValue::new(value, ttl));
                }
                Ok(matches)
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Ok(false);
                }
                vacant.insert(StoredValue::new(value, ttl));
                Ok(true)
            }
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        self.ensure_reachable()?;
        let now = Instant::now();
        Ok(self
            .entries
            .remove_if(key, |_, stored| stored.is_live(now) && stored.value == expected)
            .is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.ensure_reachable()?;
        let now = Instant::now();
        let (value, expired) = match self.entries.get(key) {
            Some(stored) if stored.is_live(now) => (Some(stored.value.clone()), false),
            Some(_) => (None, true),
            None => (None, false),
        };
        if expired {
            self.entries.remove_if(key, |_, stored| !stored.is_live(now));
        }
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.ensure_reachable()?;
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .map(|(_, stored)| stored.is_live(now))
            .unwrap_or(false))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.ensure_reachable()?;
        let pattern = compile_pattern(pattern)?;
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.value().is_live(now) && pattern.matches(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn purge_expired(&self, pattern: &str) -> Result<usize> {
        self.ensure_reachable()?;
        let pattern = compile_pattern(pattern)?;
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| !entry.value().is_live(now) && pattern.matches(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        let removed = expired
            .iter()
            .filter(|key| {
                self.entries
                    .remove_if(key.as_str(), |_, stored| !stored.is_live(now))
                    .is_some()
            })
            .count();
        Ok(removed)
    }

    fn name(&self) -> &str {
        "in_process"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_directed_delivery() {
        let backend = InProcessBackend::new();
        let mut inbox = backend.open_inbox("agent-1").await.unwrap();
        backend.subscribe("agent-1", "agent:agent-1").await.unwrap();

        let delivered = backend
            .publish("agent:agent-1", "hello".to_string())
            .await
            .unwrap();
        assert_eq!(delivered, 1);

        let frame = inbox.recv().await.unwrap();
        assert_eq!(frame.channel, "agent:agent-1");
        assert_eq!(frame.data, "hello");
    }

    #[tokio::test]
    async fn test_broadcast_fan_out() {
        let backend = InProcessBackend::new();
        let mut inbox1 = backend.open_inbox("a").await.unwrap();
        let mut inbox2 = backend.open_inbox("b").await.unwrap();
        let mut directed_only = backend.open_inbox("c").await.unwrap();
        backend.subscribe("a", "all").await.unwrap();
        backend.subscribe("b", "all").await.unwrap();
        backend.subscribe("c", "agent:c").await.unwrap();

        assert_eq!(backend.publish("all", "x".into()).await.unwrap(), 2);
        assert_eq!(inbox1.recv().await.unwrap().data, "x");
        assert_eq!(inbox2.recv().await.unwrap().data, "x");
        assert!(directed_only.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_and_close() {
        let backend = InProcessBackend::new();
        let mut inbox = backend.open_inbox("a").await.unwrap();
        backend.subscribe("a", "one").await.unwrap();
        backend.subscribe("a", "two").await.unwrap();
        assert_eq!(backend.subscription_count().await.unwrap(), 2);

        backend.unsubscribe("a", "one").await.unwrap();
        assert_eq!(backend.publish("one", "x".into()).await.unwrap(), 0);
        assert_eq!(backend.channel_count().await.unwrap(), 1);

        backend.close_inbox("a").await.unwrap();
        assert_eq!(backend.channel_count().await.unwrap(), 0);
        assert!(inbox.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_requires_inbox() {
        let backend = InProcessBackend::new();
        let result = backend.subscribe("ghost", "x").await;
        assert!(matches!(result, Err(CommsError::Transport(_))));
    }

    #[tokio::test]
    async fn test_zero_ttl_reads_as_absent() {
        let backend = InProcessBackend::new();
        backend
            .set("k", "v".into(), Some(Duration::ZERO))
            .await
            .unwrap();
        assert!(backend.get("k").await.unwrap().is_none());
        assert!(backend.keys("*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_compare_and_set() {
        let backend = InProcessBackend::new();
        assert!(backend.compare_and_set("k", None, "1".into(), None).await.unwrap());
        assert!(!backend.compare_and_set("k", None, "2".into(), None).await.unwrap());
        assert!(!backend
            .compare_and_set("k", Some("0"), "2".into(), None)
            .await
            .unwrap());
        assert!(backend
            .compare_and_set("k", Some("1"), "2".into(), None)
            .await
            .unwrap());
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_compare_and_delete() {
        let backend = InProcessBackend::new();
        backend.set("k", "1".into(), None).await.unwrap();
        assert!(!backend.compare_and_delete("k", "0").await.unwrap());
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("1"));
        assert!(backend.compare_and_delete("k", "1").await.unwrap());
        assert!(!backend.compare_and_delete("k", "1").await.unwrap());
    }

    #[tokio::test]
    async fn test_reopened_connections_are_independent() {
        let backend = InProcessBackend::new();
        let mut old = backend.open_inbox("scorer#1").await.unwrap();
        let mut new = backend.open_inbox("scorer#2").await.unwrap();
        backend.subscribe("scorer#1", "agent:scorer").await.unwrap();
        backend.subscribe("scorer#2", "agent:scorer").await.unwrap();

        backend.close_inbox("scorer#1").await.unwrap();
        assert!(old.recv().await.is_none());
        assert_eq!(backend.subscribers("agent:scorer"), vec!["scorer#2"]);

        assert_eq!(backend.publish("agent:scorer", "x".into()).await.unwrap(), 1);
        assert_eq!(new.recv().await.unwrap().data, "x");
    }

    #[tokio::test]
    async fn test_keys_and_purge() {
        let backend = InProcessBackend::new();
        backend.set("context:a", "1".into(), None).await.unwrap();
        backend.set("context:b", "2".into(), Some(Duration::ZERO)).await.unwrap();
        backend.set("registry:x", "3".into(), Some(Duration::ZERO)).await.unwrap();

        assert_eq!(backend.keys("context:*").await.unwrap(), vec!["context:a"]);
        assert_eq!(backend.purge_expired("context:*").await.unwrap(), 1);
        assert_eq!(backend.purge_expired("*").await.unwrap(), 1);
        assert_eq!(backend.purge_expired("*").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bad_pattern() {
        let backend = InProcessBackend::new();
        let result = backend.keys("context:[").await;
        assert!(matches!(result, Err(CommsError::InvalidPattern { .. })));
    }

    #[tokio::test]
    async fn test_offline_fails_fast() {
        let backend = InProcessBackend::new();
        backend.set_reachable(false);

        assert!(backend.ping().await.unwrap_err().is_connectivity());
        assert!(backend.open_inbox("a").await.unwrap_err().is_connectivity());
        assert!(backend.publish("x", "y".into()).await.unwrap_err().is_connectivity());
        assert!(backend.get("k").await.unwrap_err().is_connectivity());

        backend.set_reachable(true);
        assert!(backend.ping().await.is_ok());
    }
}
