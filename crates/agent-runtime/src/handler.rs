//! Message handlers keyed by action name

use agent_comms::Message;
use async_trait::async_trait;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;

use crate::{Agent, Result};

/// Handles one inbound message
///
/// Handlers run on the agent's handler pool, never inline in the receive
/// loop. A request handler must reply itself with
/// [`Agent::send_response`]; an `Err` is logged and counted, the sender
/// gets nothing and eventually times out.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, agent: &Agent, message: Message) -> Result<()>;
}

/// Adapts an async closure into a [`MessageHandler`]
pub(crate) struct FnHandler<F>(pub(crate) F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Agent, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, agent: &Agent, message: Message) -> Result<()> {
        (self.0)(agent.clone(), message).await
    }
}

/// Dispatch table; the last registration for an action wins
#[derive(Clone, Default)]
pub(crate) struct HandlerTable {
    handlers: Arc<DashMap<String, Arc<dyn MessageHandler>>>,
}

impl HandlerTable {
    pub(crate) fn insert(&self, action: &str, handler: Arc<dyn MessageHandler>) -> bool {
        self.handlers.insert(action.to_string(), handler).is_some()
    }

    pub(crate) fn remove(&self, action: &str) -> bool {
        self.handlers.remove(action).is_some()
    }

    pub(crate) fn get(&self, action: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(action).map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn actions(&self) -> Vec<String> {
        let mut actions: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        actions.sort();
        actions
    }
}
