//! Agent directory held by the broker

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{message::Payload, store::KeyValueStore, Result};

const REGISTRY_PREFIX: &str = "registry:";

/// One directory entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub agent_id: String,
    pub agent_type: String,
    #[serde(default)]
    pub metadata: Payload,
    pub registered_at: DateTime<Utc>,
    /// Transport connection of the instance that registered, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
}

/// Directory of live agents
///
/// Lives in the broker's store, so it is only as durable as that store.
#[derive(Clone)]
pub struct AgentDirectory {
    store: Arc<dyn KeyValueStore>,
}

impl AgentDirectory {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn key(agent_id: &str) -> String {
        format!("{}{}", REGISTRY_PREFIX, agent_id)
    }

    /// Upsert; reusing an id replaces the previous entry
    pub async fn register(
        &self,
        agent_id: &str,
        agent_type: &str,
        metadata: Payload,
    ) -> Result<AgentRegistration> {
        self.upsert(agent_id, agent_type, metadata, None).await
    }

    /// Upsert an entry owned by one transport connection
    pub async fn register_connection(
        &self,
        agent_id: &str,
        agent_type: &str,
        metadata: Payload,
        connection_id: &str,
    ) -> Result<AgentRegistration> {
        self.upsert(agent_id, agent_type, metadata, Some(connection_id.to_string()))
            .await
    }

    async fn upsert(
        &self,
        agent_id: &str,
        agent_type: &str,
        metadata: Payload,
        connection_id: Option<String>,
    ) -> Result<AgentRegistration> {
        let registration = AgentRegistration {
            agent_id: agent_id.to_string(),
            agent_type: agent_type.to_string(),
            metadata,
            registered_at: Utc::now(),
            connection_id,
        };
        self.store
            .set(&Self::key(agent_id), serde_json::to_string(&registration)?, None)
            .await?;
        tracing::debug!(agent_id, agent_type, "Registered agent");
        Ok(registration)
    }

    /// Returns whether an entry existed
    pub async fn unregister(&self, agent_id: &str) -> Result<bool> {
        let removed = self.store.delete(&Self::key(agent_id)).await?;
        tracing::debug!(agent_id, removed, "Unregistered agent");
        Ok(removed)
    }

    /// Remove the entry only while `connection_id` still owns it
    ///
    /// A newer instance that re-registered the same id keeps its entry.
    pub async fn unregister_connection(&self, agent_id: &str, connection_id: &str) -> Result<bool> {
        let key = Self::key(agent_id);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(false);
        };
        let current: AgentRegistration = serde_json::from_str(&raw)?;
        if current.connection_id.as_deref() != Some(connection_id) {
            tracing::debug!(agent_id, connection_id, "Entry owned by a newer instance, kept");
            return Ok(false);
        }
        let removed = self.store.compare_and_delete(&key, &raw).await?;
        tracing::debug!(agent_id, removed, "Unregistered agent");
        Ok(removed)
    }

    pub async fn lookup(&self, agent_id: &str) -> Result<Option<AgentRegistration>> {
        match self.store.get(&Self::key(agent_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn is_registered(&self, agent_id: &str) -> Result<bool> {
        Ok(self.store.get(&Self::key(agent_id)).await?.is_some())
    }

    /// All entries, ordered by agent id
    pub async fn list_all(&self) -> Result<Vec<AgentRegistration>> {
        let mut agents = Vec::new();
        for key in self.store.keys(&format!("{}*", REGISTRY_PREFIX)).await? {
            // Unregistered between listing and reading
            if let Some(raw) = self.store.get(&key).await? {
                agents.push(serde_json::from_str(&raw)?);
            }
        }
        Ok(agents)
    }

    pub async fn find_by_type(&self, agent_type: &str) -> Result<Vec<AgentRegistration>> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|a| a.agent_type == agent_type)
            .collect())
    }

    pub async fn count(&self) -> Result<usize> {
        Ok(self
            .store
            .keys(&format!("{}*", REGISTRY_PREFIX))
            .await?
            .len())
    }
}
