//! Broker: pub/sub relay, agent directory, and context store
//!
//! The broker is blind to payloads. It validates envelopes, picks a channel,
//! and hands serialized frames to the transport. It never buffers or retries;
//! if the transport is down, the call fails with
//! [`CommsError::Connectivity`].

use agent_core::BrokerSettings;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    channel::ChannelNames,
    context::{ContextStore, WorkflowContext},
    in_process::InProcessBackend,
    message::{Message, Payload},
    registry::{AgentDirectory, AgentRegistration},
    store::KeyValueStore,
    transport::{Frame, Inbox, MessageTransport},
    Result,
};

/// Reachability of the broker's backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerHealth {
    pub reachable: bool,
    pub transport: String,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

/// Operational counters; read-only and safe to poll
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerStats {
    pub registered_agents: usize,
    pub open_contexts: usize,
    pub channels: usize,
    pub subscriptions: usize,
}

/// Shared handle every agent and client talks through
///
/// Pass it around as `Arc<Broker>`; there is no process-wide instance.
pub struct Broker {
    transport: Arc<dyn MessageTransport>,
    directory: AgentDirectory,
    contexts: ContextStore,
    channels: ChannelNames,
    settings: BrokerSettings,
}

impl Broker {
    pub fn new(
        transport: Arc<dyn MessageTransport>,
        store: Arc<dyn KeyValueStore>,
        settings: BrokerSettings,
    ) -> Self {
        Self {
            transport,
            directory: AgentDirectory::new(Arc::clone(&store)),
            contexts: ContextStore::new(store),
            channels: ChannelNames::from_settings(&settings),
            settings,
        }
    }

    /// Broker over a fresh in-process backend with default settings
    pub fn in_process() -> Self {
        Self::with_backend(InProcessBackend::new(), BrokerSettings::default())
    }

    /// Broker over a given in-process backend (keep a clone to toggle reachability)
    pub fn with_backend(backend: InProcessBackend, settings: BrokerSettings) -> Self {
        let backend = Arc::new(backend);
        Self::new(backend.clone(), backend, settings)
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    pub fn channels(&self) -> &ChannelNames {
        &self.channels
    }

    /// Direct access to the context store
    pub fn contexts(&self) -> &ContextStore {
        &self.contexts
    }

    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    // --- Directory ---

    /// Upsert a directory entry; last write wins on id reuse
    pub async fn register(
        &self,
        agent_id: &str,
        agent_type: &str,
        metadata: Payload,
    ) -> Result<AgentRegistration> {
        self.directory.register(agent_id, agent_type, metadata).await
    }

    /// Remove a directory entry; published messages are not recalled
    pub async fn unregister(&self, agent_id: &str) -> Result<bool> {
        self.directory.unregister(agent_id).await
    }

    /// Upsert a directory entry owned by an open connection
    pub async fn register_connection(
        &self,
        agent_id: &str,
        agent_type: &str,
        metadata: Payload,
        connection_id: &str,
    ) -> Result<AgentRegistration> {
        self.directory
            .register_connection(agent_id, agent_type, metadata, connection_id)
            .await
    }

    /// Remove a directory entry unless a newer connection re-registered the id
    pub async fn unregister_connection(&self, agent_id: &str, connection_id: &str) -> Result<bool> {
        self.directory
            .unregister_connection(agent_id, connection_id)
            .await
    }

    pub async fn is_agent_registered(&self, agent_id: &str) -> Result<bool> {
        self.directory.is_registered(agent_id).await
    }

    pub async fn get_agent(&self, agent_id: &str) -> Result<Option<AgentRegistration>> {
        self.directory.lookup(agent_id).await
    }

    pub async fn list_agents(&self) -> Result<Vec<AgentRegistration>> {
        self.directory.list_all().await
    }

    pub async fn agents_by_type(&self, agent_type: &str) -> Result<Vec<AgentRegistration>> {
        self.directory.find_by_type(agent_type).await
    }

    // --- Pub/sub ---

    /// Route a message to its receiver's channel, or to the broadcast channel
    ///
    /// Fire-and-forget: the returned count is how many subscribers the
    /// transport handed the frame to, not a delivery confirmation.
    pub async fn publish(&self, message: &Message) -> Result<usize> {
        message.validate()?;
        let channel = self.channels.route(message);
        let delivered = self.transport.publish(&channel, message.to_json()?).await?;
        tracing::debug!(
            message_id = %message.message_id,
            kind = %message.kind,
            action = %message.action,
            channel = %channel,
            delivered,
            "Published message"
        );
        Ok(delivered)
    }

    /// Open a fresh connection for an agent instance
    ///
    /// Every call gets its own connection id (`{agent_id}#{uuid}`, see
    /// [`Inbox::subscriber_id`]), so two instances sharing an agent id never
    /// replace or close each other's connection.
    pub async fn open_inbox(&self, agent_id: &str) -> Result<Inbox> {
        let connection_id = format!("{}#{}", agent_id, uuid::Uuid::new_v4().simple());
        self.transport.open_inbox(&connection_id).await
    }

    /// Drop a connection and every channel it joined
    pub async fn close_inbox(&self, connection_id: &str) -> Result<()> {
        self.transport.close_inbox(connection_id).await
    }

    pub async fn subscribe(&self, connection_id: &str, channel: &str) -> Result<()> {
        self.transport.subscribe(connection_id, channel).await
    }

    pub async fn unsubscribe(&self, connection_id: &str, channel: &str) -> Result<()> {
        self.transport.unsubscribe(connection_id, channel).await
    }

    /// Parse a received frame back into a message
    pub fn decode(&self, frame: &Frame) -> Result<Message> {
        Message::from_json(&frame.data)
    }

    // --- Contexts ---

    /// Create a context; `None` TTL falls back to the configured default
    pub async fn create_context(
        &self,
        task_id: &str,
        workflow_type: &str,
        shared_data: Payload,
        metadata: Payload,
        ttl: Option<Duration>,
    ) -> Result<WorkflowContext> {
        let ttl = ttl.or_else(|| self.settings.default_context_ttl());
        self.contexts
            .create(task_id, workflow_type, shared_data, metadata, ttl)
            .await
    }

    pub async fn get_context(&self, context_id: &str) -> Result<WorkflowContext> {
        self.contexts.get(context_id).await
    }

    /// Blind whole-record overwrite
    pub async fn update_context(&self, context: &mut WorkflowContext) -> Result<()> {
        self.contexts.update(context).await
    }

    /// Overwrite only if nobody wrote since `context.version` was read
    pub async fn update_context_if_version(&self, context: &mut WorkflowContext) -> Result<()> {
        self.contexts.update_if_version(context).await
    }

    pub async fn delete_context(&self, context_id: &str) -> Result<bool> {
        self.contexts.delete(context_id).await
    }

    pub async fn list_contexts(&self, pattern: &str) -> Result<Vec<String>> {
        self.contexts.list(pattern).await
    }

    pub async fn sweep_contexts(&self) -> Result<usize> {
        self.contexts.sweep().await
    }

    /// Periodically purge expired contexts until `shutdown` fires
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let broker = Arc::clone(self);
        let period = self.settings.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = broker.sweep_contexts().await {
                            tracing::warn!(error = %e, "Context sweep failed");
                        }
                    }
                }
            }
            tracing::debug!("Context sweeper stopped");
        })
    }

    // --- Operations ---

    pub async fn health(&self) -> BrokerHealth {
        let started = Instant::now();
        match self.transport.ping().await {
            Ok(()) => BrokerHealth {
                reachable: true,
                transport: self.transport.name().to_string(),
                latency_ms: Some(started.elapsed().as_millis() as u64),
                error: None,
            },
            Err(e) => BrokerHealth {
                reachable: false,
                transport: self.transport.name().to_string(),
                latency_ms: None,
                error: Some(e.to_string()),
            },
        }
    }

    pub async fn stats(&self) -> Result<BrokerStats> {
        Ok(BrokerStats {
            registered_agents: self.directory.count().await?,
            open_contexts: self.contexts.count().await?,
            channels: self.transport.channel_count().await?,
            subscriptions: self.transport.subscription_count().await?,
        })
    }
}
