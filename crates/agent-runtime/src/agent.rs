//! Agent implementation

use agent_comms::{Broker, Frame, Inbox, Message, Payload, WorkflowContext};
use agent_core::AgentSettings;
use agent_telemetry::{TelemetryCollector, TelemetryEvent};
use chrono::Utc;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::{
    handler::{FnHandler, HandlerTable, MessageHandler},
    pending::{PendingRequests, PendingResponse},
    role::{RoleActions, RoleDispatcher, RoleHandler},
    stats::{AgentStats, StatsSnapshot},
    Result, RuntimeError,
};

/// Lifecycle of an agent
///
/// `NotStarted -> Running -> Stopping -> Stopped`. An agent is started at
/// most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    NotStarted,
    Running,
    /// Receive loop cancelled or connection lost; handlers may still drain
    Stopping,
    Stopped,
}

impl AgentState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::NotStarted,
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::NotStarted => 0,
            Self::Running => 1,
            Self::Stopping => 2,
            Self::Stopped => 3,
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

enum Lifecycle {
    NotStarted,
    Running {
        connection: String,
        shutdown: CancellationToken,
        receive_loop: JoinHandle<usize>,
    },
    Stopped,
}

struct AgentInner {
    agent_id: String,
    agent_type: String,
    metadata: Payload,
    broker: Arc<Broker>,
    settings: AgentSettings,
    handlers: HandlerTable,
    pending: PendingRequests,
    stats: AgentStats,
    telemetry: Option<TelemetryCollector>,
    state: AtomicU8,
    lifecycle: Mutex<Lifecycle>,
}

/// An actor that talks to other agents only through the broker
///
/// Cloning is cheap and every clone drives the same agent. Handlers receive
/// a clone so they can reply, call other agents, and touch contexts.
///
/// The receive loop and running handlers hold clones, so an agent that was
/// started must be [`stop`](Self::stop)ped to be released.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("agent_id", &self.inner.agent_id)
            .field("agent_type", &self.inner.agent_type)
            .field("state", &self.state())
            .finish()
    }
}

impl Agent {
    /// Create an agent with the given settings
    pub fn new(
        agent_id: impl Into<String>,
        agent_type: impl Into<String>,
        broker: Arc<Broker>,
        settings: AgentSettings,
    ) -> Self {
        Self::builder(agent_id, agent_type, broker)
            .settings(settings)
            .build()
    }

    /// Create an agent builder
    pub fn builder(
        agent_id: impl Into<String>,
        agent_type: impl Into<String>,
        broker: Arc<Broker>,
    ) -> AgentBuilder {
        AgentBuilder::new(agent_id, agent_type, broker)
    }

    pub fn id(&self) -> &str {
        &self.inner.agent_id
    }

    pub fn agent_type(&self) -> &str {
        &self.inner.agent_type
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.inner.broker
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.inner.settings
    }

    pub fn state(&self) -> AgentState {
        AgentState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == AgentState::Running
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Number of requests still waiting for a response
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Actions with a registered handler, sorted
    pub fn actions(&self) -> Vec<String> {
        self.inner.handlers.actions()
    }

    fn set_state(&self, state: AgentState) {
        self.inner.state.store(state.as_u8(), Ordering::Release);
    }

    fn emit(&self, event: impl FnOnce() -> TelemetryEvent) {
        if let Some(telemetry) = &self.inner.telemetry {
            telemetry.emit(event());
        }
    }

    // --- Lifecycle ---

    /// Register with the broker, subscribe, and launch the receive loop
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if !matches!(*lifecycle, Lifecycle::NotStarted) {
            return Err(RuntimeError::AlreadyStarted(self.id().to_string()));
        }

        let inbox = self.attach().await?;
        let connection = inbox.subscriber_id().to_string();
        let shutdown = CancellationToken::new();
        // Set before spawning; a loop whose inbox closes at once moves it on
        self.set_state(AgentState::Running);
        let receive_loop = tokio::spawn(receive_loop(self.clone(), inbox, shutdown.clone()));

        *lifecycle = Lifecycle::Running {
            connection,
            shutdown,
            receive_loop,
        };

        tracing::info!(
            agent_id = %self.inner.agent_id,
            agent_type = %self.inner.agent_type,
            actions = ?self.actions(),
            "Agent started"
        );
        self.emit(|| TelemetryEvent::agent_started(self.id(), self.agent_type()));
        Ok(())
    }

    async fn attach(&self) -> Result<Inbox> {
        let broker = &self.inner.broker;
        let id = self.id();
        let inbox = broker.open_inbox(id).await?;
        let connection = inbox.subscriber_id();

        let joined = async {
            broker
                .register_connection(
                    id,
                    &self.inner.agent_type,
                    self.inner.metadata.clone(),
                    connection,
                )
                .await?;
            broker.subscribe(connection, &broker.channels().directed(id)).await?;
            broker.subscribe(connection, broker.channels().broadcast()).await
        }
        .await;

        if let Err(e) = joined {
            // Best effort; the broker may be the thing that failed
            let _ = broker.close_inbox(connection).await;
            let _ = broker.unregister_connection(id, connection).await;
            return Err(e.into());
        }
        Ok(inbox)
    }

    /// Stop receiving, drain handlers, and leave the broker
    ///
    /// Pending requests fail with [`RuntimeError::Cancelled`]. In-flight
    /// handlers get `shutdown_grace` to finish and are aborted after that.
    /// The agent is stopped locally even when leaving the broker fails; that
    /// failure is returned. Stopping twice is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let (connection, shutdown, receive_loop) = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Running {
                connection,
                shutdown,
                receive_loop,
            } => (connection, shutdown, receive_loop),
            Lifecycle::NotStarted | Lifecycle::Stopped => {
                self.set_state(AgentState::Stopped);
                return Ok(());
            }
        };

        self.set_state(AgentState::Stopping);
        shutdown.cancel();
        let cancelled = self.inner.pending.cancel_all();

        let aborted = match receive_loop.await {
            Ok(aborted) => aborted,
            Err(e) => {
                tracing::error!(agent_id = %self.inner.agent_id, error = %e, "Receive loop panicked");
                0
            }
        };

        let detached = self.detach(&connection).await;
        self.set_state(AgentState::Stopped);

        tracing::info!(
            agent_id = %self.inner.agent_id,
            cancelled_requests = cancelled,
            aborted_handlers = aborted,
            "Agent stopped"
        );
        self.emit(|| TelemetryEvent::agent_stopped(self.id(), aborted));
        detached
    }

    /// Leave the broker, attempting every step; the first failure is returned
    ///
    /// Only this instance's connection and directory entry are touched, so a
    /// newer instance that reused the id stays reachable.
    async fn detach(&self, connection: &str) -> Result<()> {
        let broker = &self.inner.broker;
        let id = self.id();
        let steps = [
            broker.unsubscribe(connection, &broker.channels().directed(id)).await,
            broker.unsubscribe(connection, broker.channels().broadcast()).await,
            broker.close_inbox(connection).await,
            broker.unregister_connection(id, connection).await.map(|_| ()),
        ];

        let mut first_error = None;
        for result in steps {
            if let Err(e) = result {
                tracing::warn!(agent_id = %id, connection, error = %e, "Failed to leave broker cleanly");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(RuntimeError::NotRunning(self.id().to_string()))
        }
    }

    /// Publishing stays open while handlers drain so they can still reply
    fn ensure_can_publish(&self) -> Result<()> {
        match self.state() {
            AgentState::Running | AgentState::Stopping => Ok(()),
            _ => Err(RuntimeError::NotRunning(self.id().to_string())),
        }
    }

    // --- Handlers ---

    /// Register an async closure for `action`; replaces any previous handler
    pub fn register_handler<F, Fut>(&self, action: impl AsRef<str>, handler: F)
    where
        F: Fn(Agent, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register_message_handler(action, Arc::new(FnHandler(handler)));
    }

    /// Register a handler object for `action`; replaces any previous handler
    pub fn register_message_handler(
        &self,
        action: impl AsRef<str>,
        handler: Arc<dyn MessageHandler>,
    ) {
        let action = action.as_ref();
        let replaced = self.inner.handlers.insert(action, handler);
        tracing::debug!(agent_id = %self.inner.agent_id, action, replaced, "Registered handler");
    }

    /// Register one handler for every action of a role
    pub fn register_role<A, H>(&self, handler: H)
    where
        A: RoleActions,
        H: RoleHandler<A>,
    {
        let dispatcher: Arc<dyn MessageHandler> = Arc::new(RoleDispatcher::<A, H>::new(Arc::new(handler)));
        for action in A::ALL {
            self.register_message_handler(action.name(), Arc::clone(&dispatcher));
        }
    }

    /// Returns whether a handler was registered
    pub fn unregister_handler(&self, action: &str) -> bool {
        let removed = self.inner.handlers.remove(action);
        tracing::debug!(agent_id = %self.inner.agent_id, action, removed, "Unregistered handler");
        removed
    }

    // --- Sending ---

    async fn publish(&self, message: &Message) -> Result<()> {
        let delivered = self.inner.broker.publish(message).await?;
        tracing::debug!(
            agent_id = %self.inner.agent_id,
            message_id = %message.message_id,
            kind = %message.kind,
            action = %message.action,
            receiver = ?message.receiver,
            delivered,
            "Sent message"
        );
        self.emit(|| TelemetryEvent::MessageSent {
            agent_id: self.id().to_string(),
            message_id: message.message_id.clone(),
            receiver: message.receiver.clone(),
            kind: message.kind.to_string(),
            action: message.action.clone(),
            timestamp: message.timestamp,
        });
        Ok(())
    }

    /// Send a request and wait for the correlated response
    ///
    /// `timeout` defaults to the configured request timeout. Timing out only
    /// abandons the local wait; the receiver may still handle the request,
    /// and its late response is dropped.
    pub async fn send_request(
        &self,
        receiver: &str,
        action: &str,
        payload: Payload,
        context_id: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Message> {
        self.ensure_running()?;
        let request = Message::request(self.id(), receiver, action, payload)
            .with_context_opt(context_id.map(str::to_string));
        let after = timeout.unwrap_or_else(|| self.inner.settings.request_timeout());

        // Registered before publishing so a fast reply cannot be missed
        let mut waiter = self.register_waiter(&request.message_id)?;
        self.publish(&request).await?;

        match tokio::time::timeout(after, waiter.receiver()).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(RuntimeError::Cancelled),
            Err(_) => {
                self.inner.stats.record_timeout();
                tracing::warn!(
                    agent_id = %self.inner.agent_id,
                    message_id = %request.message_id,
                    receiver,
                    action,
                    timeout_ms = after.as_millis() as u64,
                    "Request timed out"
                );
                self.emit(|| TelemetryEvent::RequestTimedOut {
                    agent_id: self.id().to_string(),
                    message_id: request.message_id.clone(),
                    receiver: receiver.to_string(),
                    action: action.to_string(),
                    timeout_ms: after.as_millis() as u64,
                    timestamp: Utc::now(),
                });
                Err(RuntimeError::Timeout {
                    action: action.to_string(),
                    after,
                })
            }
        }
    }

    /// Pending entry for an outgoing request
    ///
    /// `stop` may have run `cancel_all` between the running check and the
    /// insert; such a waiter would never be cancelled, so it is refused here.
    fn register_waiter(&self, message_id: &str) -> Result<PendingResponse> {
        let waiter = self.inner.pending.register(message_id);
        if !self.is_running() {
            return Err(RuntimeError::Cancelled);
        }
        Ok(waiter)
    }

    /// [`send_request`](Self::send_request) with no context and the default timeout
    pub async fn request(&self, receiver: &str, action: &str, payload: Payload) -> Result<Message> {
        self.send_request(receiver, action, payload, None, None).await
    }

    /// Reply to a request
    pub async fn send_response(&self, original: &Message, payload: Payload) -> Result<()> {
        self.ensure_can_publish()?;
        let response = Message::create_response(original, payload, self.id());
        self.publish(&response).await
    }

    /// Fire-and-forget message; `None` receiver broadcasts
    pub async fn send_notification(
        &self,
        action: &str,
        payload: Payload,
        receiver: Option<&str>,
    ) -> Result<()> {
        self.ensure_can_publish()?;
        let notification =
            Message::notification(self.id(), receiver.map(str::to_string), action, payload);
        self.publish(&notification).await
    }

    /// Broadcast an event to every agent
    pub async fn publish_event(&self, action: &str, payload: Payload) -> Result<()> {
        self.ensure_can_publish()?;
        self.publish(&Message::event(self.id(), action, payload)).await
    }

    // --- Contexts ---

    /// Create a workflow context with this agent as its first participant
    ///
    /// `None` TTL uses the broker's default.
    pub async fn create_context(
        &self,
        task_id: &str,
        workflow_type: &str,
        shared_data: Payload,
        metadata: Payload,
        ttl: Option<Duration>,
    ) -> Result<WorkflowContext> {
        let mut context = self
            .inner
            .broker
            .create_context(task_id, workflow_type, shared_data, metadata, ttl)
            .await?;
        context.add_participant(self.id());
        self.inner.broker.update_context(&mut context).await?;
        tracing::debug!(
            agent_id = %self.inner.agent_id,
            context_id = %context.context_id,
            "Created context"
        );
        Ok(context)
    }

    pub async fn get_context(&self, context_id: &str) -> Result<WorkflowContext> {
        Ok(self.inner.broker.get_context(context_id).await?)
    }

    /// Overwrite the stored context with `context`, adding this agent as participant
    pub async fn update_context(&self, context: &mut WorkflowContext) -> Result<()> {
        context.add_participant(self.id());
        self.inner.broker.update_context(context).await?;
        Ok(())
    }

    /// Like [`update_context`](Self::update_context), but fails with a
    /// conflict if someone wrote since `context` was read
    pub async fn update_context_if_version(&self, context: &mut WorkflowContext) -> Result<()> {
        context.add_participant(self.id());
        self.inner.broker.update_context_if_version(context).await?;
        Ok(())
    }

    // --- Receiving ---

    /// Route one inbound frame; handlers go to the pool
    fn on_frame(&self, frame: Frame, pool: &mut JoinSet<()>, permits: &Arc<Semaphore>) {
        let message = match self.inner.broker.decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(
                    agent_id = %self.inner.agent_id,
                    channel = %frame.channel,
                    error = %e,
                    "Dropping undecodable frame"
                );
                return;
            }
        };

        if message.sender == self.inner.agent_id {
            tracing::trace!(agent_id = %self.inner.agent_id, message_id = %message.message_id, "Ignoring own message");
            return;
        }

        self.inner.stats.record_received();
        tracing::trace!(
            agent_id = %self.inner.agent_id,
            message_id = %message.message_id,
            sender = %message.sender,
            kind = %message.kind,
            action = %message.action,
            "Received message"
        );
        self.emit(|| TelemetryEvent::MessageReceived {
            agent_id: self.id().to_string(),
            message_id: message.message_id.clone(),
            sender: message.sender.clone(),
            kind: message.kind.to_string(),
            action: message.action.clone(),
            timestamp: message.timestamp,
        });

        if message.is_response() {
            self.on_response(message);
            return;
        }

        let Some(handler) = self.inner.handlers.get(&message.action) else {
            self.on_unhandled(&message);
            return;
        };

        self.inner.stats.record_dispatched();
        let agent = self.clone();
        let permits = Arc::clone(permits);
        pool.spawn(async move {
            // Closed only if the semaphore is dropped, which it never is while tasks run
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let message_id = message.message_id.clone();
            let action = message.action.clone();
            let outcome = AssertUnwindSafe(handler.handle(&agent, message))
                .catch_unwind()
                .await;
            let error = match outcome {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e.to_string(),
                Err(_) => "handler panicked".to_string(),
            };
            agent.on_handler_failure(&message_id, &action, error);
        });
    }

    fn on_response(&self, response: Message) {
        let Some(correlation_id) = response.correlation_id.clone() else {
            return;
        };
        match self.inner.pending.resolve(&correlation_id, response) {
            None => self.inner.stats.record_response_matched(),
            Some(late) => {
                self.inner.stats.record_late_response();
                tracing::debug!(
                    agent_id = %self.inner.agent_id,
                    correlation_id = %correlation_id,
                    sender = %late.sender,
                    "Dropping response with no pending request"
                );
                self.emit(|| TelemetryEvent::ResponseDropped {
                    agent_id: self.id().to_string(),
                    correlation_id,
                    sender: late.sender.clone(),
                    timestamp: Utc::now(),
                });
            }
        }
    }

    fn on_unhandled(&self, message: &Message) {
        if message.is_broadcast() {
            tracing::trace!(
                agent_id = %self.inner.agent_id,
                action = %message.action,
                "No handler for broadcast"
            );
            return;
        }

        self.inner.stats.record_dead_letter();
        tracing::warn!(
            agent_id = %self.inner.agent_id,
            message_id = %message.message_id,
            sender = %message.sender,
            action = %message.action,
            "Dead letter: no handler for directed message"
        );
        self.emit(|| {
            TelemetryEvent::dead_letter(
                self.id(),
                &message.message_id,
                &message.sender,
                &message.action,
            )
        });
    }

    fn on_handler_failure(&self, message_id: &str, action: &str, error: String) {
        self.inner.stats.record_handler_failure();
        tracing::error!(
            agent_id = %self.inner.agent_id,
            message_id,
            action,
            error = %error,
            "Handler failed"
        );
        self.emit(|| TelemetryEvent::handler_failed(self.id(), message_id, action, error));
    }

    /// The transport dropped this instance's connection
    ///
    /// The agent can no longer receive, so it leaves `Running` and fails its
    /// waiters. Broker cleanup still happens on [`stop`](Self::stop).
    fn on_inbox_closed(&self) {
        let left_running = self
            .inner
            .state
            .compare_exchange(
                AgentState::Running.as_u8(),
                AgentState::Stopping.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        let cancelled = self.inner.pending.cancel_all();
        tracing::warn!(
            agent_id = %self.inner.agent_id,
            left_running,
            cancelled_requests = cancelled,
            "Inbox closed by broker"
        );
    }
}

/// Receive until shutdown or the inbox closes, then drain the handler pool
///
/// Returns how many handlers had to be aborted.
async fn receive_loop(agent: Agent, mut inbox: Inbox, shutdown: CancellationToken) -> usize {
    let permits = Arc::new(Semaphore::new(agent.inner.settings.max_in_flight_handlers));
    let mut pool = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            Some(_) = pool.join_next(), if !pool.is_empty() => {}
            frame = inbox.recv() => match frame {
                Some(frame) => agent.on_frame(frame, &mut pool, &permits),
                None => {
                    agent.on_inbox_closed();
                    break;
                }
            },
        }
    }

    drain(&agent, pool).await
}

async fn drain(agent: &Agent, mut pool: JoinSet<()>) -> usize {
    if pool.is_empty() {
        return 0;
    }

    let grace = agent.inner.settings.shutdown_grace();
    tracing::debug!(
        agent_id = %agent.inner.agent_id,
        in_flight = pool.len(),
        grace_ms = grace.as_millis() as u64,
        "Draining handlers"
    );
    let finished = tokio::time::timeout(grace, async {
        while pool.join_next().await.is_some() {}
    })
    .await;
    if finished.is_ok() {
        return 0;
    }

    let aborted = pool.len();
    tracing::warn!(agent_id = %agent.inner.agent_id, aborted, "Aborting handlers past shutdown grace");
    pool.shutdown().await;
    aborted
}

/// Builder for [`Agent`]
pub struct AgentBuilder {
    agent_id: String,
    agent_type: String,
    broker: Arc<Broker>,
    metadata: Payload,
    settings: AgentSettings,
    telemetry: Option<TelemetryCollector>,
}

impl AgentBuilder {
    pub fn new(
        agent_id: impl Into<String>,
        agent_type: impl Into<String>,
        broker: Arc<Broker>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_type: agent_type.into(),
            broker,
            metadata: Payload::new(),
            settings: AgentSettings::default(),
            telemetry: None,
        }
    }

    /// Directory metadata published on start
    pub fn metadata(mut self, metadata: Payload) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn settings(mut self, settings: AgentSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.settings.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn telemetry(mut self, telemetry: TelemetryCollector) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn build(self) -> Agent {
        let mut settings = self.settings;
        // A zero-permit pool would never run a handler
        settings.max_in_flight_handlers = settings.max_in_flight_handlers.max(1);

        Agent {
            inner: Arc::new(AgentInner {
                agent_id: self.agent_id,
                agent_type: self.agent_type,
                metadata: self.metadata,
                broker: self.broker,
                settings,
                handlers: HandlerTable::default(),
                pending: PendingRequests::default(),
                stats: AgentStats::default(),
                telemetry: self.telemetry,
                state: AtomicU8::new(AgentState::NotStarted.as_u8()),
                lifecycle: Mutex::new(Lifecycle::NotStarted),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_comms::payload;
    use serde_json::json;

    fn broker() -> Arc<Broker> {
        Arc::new(Broker::in_process())
    }

    #[tokio::test]
    async fn test_lifecycle_states() {
        let broker = broker();
        let agent = Agent::new("scorer", "scorer", Arc::clone(&broker), AgentSettings::default());
        assert_eq!(agent.state(), AgentState::NotStarted);

        agent.start().await.unwrap();
        assert!(agent.is_running());
        assert!(broker.is_agent_registered("scorer").await.unwrap());

        agent.stop().await.unwrap();
        assert_eq!(agent.state(), AgentState::Stopped);
        assert!(!broker.is_agent_registered("scorer").await.unwrap());

        // Idempotent stop, no restart
        agent.stop().await.unwrap();
        assert!(matches!(agent.start().await, Err(RuntimeError::AlreadyStarted(_))));
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let agent = Agent::new("a", "t", broker(), AgentSettings::default());
        agent.start().await.unwrap();
        assert!(matches!(agent.start().await, Err(RuntimeError::AlreadyStarted(_))));
        agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_requires_running() {
        let agent = Agent::new("a", "t", broker(), AgentSettings::default());
        let err = agent.request("b", "ping", Payload::new()).await.unwrap_err();
        assert!(matches!(err, RuntimeError::NotRunning(_)));
        let err = agent.send_notification("refresh", Payload::new(), None).await.unwrap_err();
        assert!(matches!(err, RuntimeError::NotRunning(_)));
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let agent = Agent::new("a", "t", broker(), AgentSettings::default());
        agent.register_handler("ping", |_, _| async { Err(RuntimeError::handler("old")) });
        agent.register_handler("ping", |_, _| async { Ok(()) });
        agent.register_handler("pong", |_, _| async { Ok(()) });
        assert_eq!(agent.actions(), vec!["ping", "pong"]);

        assert!(agent.unregister_handler("pong"));
        assert!(!agent.unregister_handler("pong"));
        assert_eq!(agent.actions(), vec!["ping"]);
    }

    #[tokio::test]
    async fn test_start_fails_fast_when_broker_down() {
        let backend = agent_comms::InProcessBackend::new();
        let broker = Arc::new(Broker::with_backend(backend.clone(), Default::default()));
        backend.set_reachable(false);

        let agent = Agent::new("a", "t", broker, AgentSettings::default());
        let err = agent.start().await.unwrap_err();
        assert!(matches!(err, RuntimeError::Comms(ref e) if e.is_connectivity()));
        assert_eq!(agent.state(), AgentState::NotStarted);
    }

    #[tokio::test]
    async fn test_context_helpers_track_participants() {
        let broker = broker();
        let agent = Agent::new("matcher", "matcher", Arc::clone(&broker), AgentSettings::default());

        let mut context = agent
            .create_context(
                "task-9",
                "screening",
                payload(json!({"stage": "new"})),
                payload(json!({"origin": "unit"})),
                None,
            )
            .await
            .unwrap();
        assert!(context.participants.contains("matcher"));
        assert_eq!(context.metadata["origin"], "unit");

        let other = Agent::new("scorer", "scorer", broker, AgentSettings::default());
        context.set_value("score", json!(0.5));
        other.update_context(&mut context).await.unwrap();

        let stored = agent.get_context(&context.context_id).await.unwrap();
        assert_eq!(stored.shared_data["score"], 0.5);
        assert_eq!(stored.participants.len(), 2);
    }

    /// In-process transport whose unsubscribe always fails
    struct StickySubscriptions(agent_comms::InProcessBackend);

    #[async_trait::async_trait]
    impl agent_comms::MessageTransport for StickySubscriptions {
        async fn open_inbox(&self, subscriber_id: &str) -> agent_comms::Result<Inbox> {
            self.0.open_inbox(subscriber_id).await
        }

        async fn close_inbox(&self, subscriber_id: &str) -> agent_comms::Result<()> {
            self.0.close_inbox(subscriber_id).await
        }

        async fn subscribe(&self, subscriber_id: &str, channel: &str) -> agent_comms::Result<()> {
            self.0.subscribe(subscriber_id, channel).await
        }

        async fn unsubscribe(&self, _: &str, _: &str) -> agent_comms::Result<()> {
            Err(agent_comms::CommsError::transport("unsubscribe rejected"))
        }

        async fn publish(&self, channel: &str, data: String) -> agent_comms::Result<usize> {
            self.0.publish(channel, data).await
        }

        async fn ping(&self) -> agent_comms::Result<()> {
            self.0.ping().await
        }

        async fn channel_count(&self) -> agent_comms::Result<usize> {
            self.0.channel_count().await
        }

        async fn subscription_count(&self) -> agent_comms::Result<usize> {
            self.0.subscription_count().await
        }

        fn name(&self) -> &str {
            "sticky"
        }
    }

    #[tokio::test]
    async fn test_stop_finishes_cleanup_after_failed_step() {
        let backend = agent_comms::InProcessBackend::new();
        let broker = Arc::new(Broker::new(
            Arc::new(StickySubscriptions(backend.clone())),
            Arc::new(backend.clone()),
            Default::default(),
        ));
        let agent = Agent::new("a", "t", Arc::clone(&broker), AgentSettings::default());
        agent.start().await.unwrap();

        let err = agent.stop().await.unwrap_err();
        assert!(matches!(err, RuntimeError::Comms(agent_comms::CommsError::Transport(_))));
        assert_eq!(agent.state(), AgentState::Stopped);
        assert!(!broker.is_agent_registered("a").await.unwrap());
        assert_eq!(broker.stats().await.unwrap().subscriptions, 0);
    }

    #[tokio::test]
    async fn test_waiter_refused_once_stopping() {
        let agent = Agent::new("a", "t", broker(), AgentSettings::default());
        agent.set_state(AgentState::Running);
        let waiter = agent.register_waiter("m-1");
        assert!(waiter.is_ok());
        assert_eq!(agent.pending_requests(), 1);
        drop(waiter);

        // stop() flipped the state after the running check but before the insert
        agent.set_state(AgentState::Stopping);
        assert!(matches!(agent.register_waiter("m-2"), Err(RuntimeError::Cancelled)));
        assert_eq!(agent.pending_requests(), 0);
    }

    #[test]
    fn test_zero_pool_size_is_clamped() {
        let settings = AgentSettings {
            max_in_flight_handlers: 0,
            ..AgentSettings::default()
        };
        let agent = Agent::new("a", "t", broker(), settings);
        assert_eq!(agent.settings().max_in_flight_handlers, 1);
    }
}
