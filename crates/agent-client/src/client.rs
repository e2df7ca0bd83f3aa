//! Single-call facade for code that is not itself an agent

use agent_comms::{failure_reason, Broker, Payload, WorkflowContext};
use agent_core::AgentSettings;
use agent_runtime::Agent;
use agent_telemetry::TelemetryCollector;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};

use crate::{factory::AgentFactory, ClientError, Result};

/// Calls agents on behalf of a non-agent caller
///
/// Backing agents are built and started on the first call, exactly once,
/// and stopped by [`shutdown`](Self::shutdown). The client talks through its
/// own caller agent, which is never given handlers.
pub struct AgentClient {
    broker: Arc<Broker>,
    settings: AgentSettings,
    factory: AgentFactory,
    caller: Agent,
    started: OnceCell<()>,
    agents: Mutex<Vec<Agent>>,
}

impl AgentClient {
    /// Create a client builder
    pub fn builder(broker: Arc<Broker>) -> AgentClientBuilder {
        AgentClientBuilder::new(broker)
    }

    pub fn id(&self) -> &str {
        self.caller.id()
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn is_started(&self) -> bool {
        self.started.initialized()
    }

    /// Ids of the backing agents this client started
    pub async fn agent_ids(&self) -> Vec<String> {
        self.agents
            .lock()
            .await
            .iter()
            .map(|a| a.id().to_string())
            .collect()
    }

    /// Bring up the caller and every backing agent, once
    pub async fn ensure_started(&self) -> Result<()> {
        self.started
            .get_or_try_init(|| async {
                let agents = self.factory.build_all(&self.broker, &self.settings)?;
                // Survives a failed attempt; a retry reuses it
                if !self.caller.is_running() {
                    self.caller.start().await?;
                }

                let mut running = self.agents.lock().await;
                for agent in agents {
                    if let Err(e) = agent.start().await {
                        // Leave no backing agent half-started behind
                        for started in running.drain(..).rev() {
                            let _ = started.stop().await;
                        }
                        return Err(ClientError::from(e));
                    }
                    running.push(agent);
                }
                tracing::info!(
                    client_id = %self.caller.id(),
                    agents = running.len(),
                    "Client started"
                );
                Ok::<(), ClientError>(())
            })
            .await
            .map(|_| ())
    }

    /// Call `action` on `receiver` and decode the reply into `T`
    ///
    /// A reply of shape `{"success": false, "error": ...}` becomes
    /// [`ClientError::Business`]. Otherwise `payload["result"]` is decoded,
    /// or the whole payload when there is no `result` key.
    pub async fn call<T: DeserializeOwned>(
        &self,
        receiver: &str,
        action: &str,
        payload: Payload,
    ) -> Result<T> {
        self.call_inner(receiver, action, payload, None, None).await
    }

    /// [`call`](Self::call) within a workflow context
    pub async fn call_with_context<T: DeserializeOwned>(
        &self,
        receiver: &str,
        action: &str,
        payload: Payload,
        context_id: &str,
    ) -> Result<T> {
        self.call_inner(receiver, action, payload, Some(context_id), None)
            .await
    }

    /// [`call`](Self::call) with an explicit timeout
    pub async fn call_with_timeout<T: DeserializeOwned>(
        &self,
        receiver: &str,
        action: &str,
        payload: Payload,
        timeout: Duration,
    ) -> Result<T> {
        self.call_inner(receiver, action, payload, None, Some(timeout))
            .await
    }

    async fn call_inner<T: DeserializeOwned>(
        &self,
        receiver: &str,
        action: &str,
        payload: Payload,
        context_id: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<T> {
        self.ensure_started().await?;
        let reply = self
            .caller
            .send_request(receiver, action, payload, context_id, timeout)
            .await?;
        decode_reply(action, reply.payload)
    }

    /// Fire-and-forget; `None` receiver broadcasts
    pub async fn notify(&self, receiver: Option<&str>, action: &str, payload: Payload) -> Result<()> {
        self.ensure_started().await?;
        self.caller
            .send_notification(action, payload, receiver)
            .await?;
        Ok(())
    }

    /// Create the shared context for a new workflow
    pub async fn start_workflow(
        &self,
        task_id: &str,
        workflow_type: &str,
        shared_data: Payload,
        metadata: Payload,
        ttl: Option<Duration>,
    ) -> Result<WorkflowContext> {
        let context = self
            .caller
            .create_context(task_id, workflow_type, shared_data, metadata, ttl)
            .await?;
        tracing::debug!(
            client_id = %self.caller.id(),
            context_id = %context.context_id,
            workflow_type,
            "Started workflow"
        );
        Ok(context)
    }

    pub async fn get_context(&self, context_id: &str) -> Result<WorkflowContext> {
        Ok(self.caller.get_context(context_id).await?)
    }

    /// Stop the caller, then every backing agent in reverse start order
    ///
    /// Stopping continues past failures; the first one is returned.
    pub async fn shutdown(&self) -> Result<()> {
        let mut first_error = None;
        if let Err(e) = self.caller.stop().await {
            first_error = Some(ClientError::from(e));
        }

        let mut agents = self.agents.lock().await;
        for agent in agents.drain(..).rev() {
            if let Err(e) = agent.stop().await {
                tracing::warn!(agent_id = %agent.id(), error = %e, "Failed to stop agent");
                first_error.get_or_insert(ClientError::from(e));
            }
        }
        tracing::info!(client_id = %self.caller.id(), "Client shut down");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Unwrap a reply payload into the caller's type
pub fn decode_reply<T: DeserializeOwned>(action: &str, mut payload: Payload) -> Result<T> {
    if payload.get("success") == Some(&Value::Bool(false)) {
        let message = failure_reason(&payload).unwrap_or_else(|| "unknown error".to_string());
        return Err(ClientError::business(action, message));
    }

    let value = payload
        .remove("result")
        .unwrap_or(Value::Object(payload));
    serde_json::from_value(value).map_err(|source| ClientError::Decode {
        action: action.to_string(),
        source,
    })
}

/// Builder for [`AgentClient`]
pub struct AgentClientBuilder {
    broker: Arc<Broker>,
    client_id: Option<String>,
    settings: AgentSettings,
    factory: AgentFactory,
    telemetry: Option<TelemetryCollector>,
}

impl AgentClientBuilder {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self {
            broker,
            client_id: None,
            settings: AgentSettings::default(),
            factory: AgentFactory::new(),
            telemetry: None,
        }
    }

    /// Id of the client's own caller agent; random when unset
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Settings for the caller and every backing agent
    pub fn settings(mut self, settings: AgentSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Add a backing agent, built and started on first use
    pub fn agent<F>(self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(Arc<Broker>, &AgentSettings) -> Result<Agent> + Send + Sync + 'static,
    {
        self.factory.register(name, factory);
        self
    }

    pub fn factory(mut self, factory: AgentFactory) -> Self {
        self.factory = factory;
        self
    }

    pub fn telemetry(mut self, telemetry: TelemetryCollector) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn build(self) -> AgentClient {
        let client_id = self
            .client_id
            .unwrap_or_else(|| format!("client-{}", uuid::Uuid::new_v4().simple()));
        let mut caller = Agent::builder(client_id, "client", Arc::clone(&self.broker))
            .settings(self.settings.clone());
        if let Some(telemetry) = self.telemetry {
            caller = caller.telemetry(telemetry);
        }

        AgentClient {
            broker: self.broker,
            settings: self.settings,
            factory: self.factory,
            caller: caller.build(),
            started: OnceCell::new(),
            agents: Mutex::new(Vec::new()),
        }
    }
}
