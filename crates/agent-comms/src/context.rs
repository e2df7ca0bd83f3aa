//! Shared workflow context
//!
//! A [`WorkflowContext`] holds the running state of one multi-agent workflow.
//! Every participant reads it, mutates its copy, and writes the whole record
//! back. [`ContextStore::update`] is a blind overwrite: of two concurrent
//! writers the later one wins entirely. Writers that cannot afford that use
//! [`ContextStore::update_if_version`], which fails with
//! [`CommsError::ContextConflict`] instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::{message::Payload, store::KeyValueStore, CommsError, Result};

const CONTEXT_PREFIX: &str = "context:";

/// Lifecycle of a context; everything but `Active` is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextStatus {
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl ContextStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ContextStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task-scoped record shared across agents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub context_id: String,
    pub task_id: String,
    pub workflow_type: String,
    #[serde(default)]
    pub shared_data: Payload,
    #[serde(default)]
    pub metadata: Payload,
    pub status: ContextStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Agents that touched this context
    #[serde(default)]
    pub participants: BTreeSet<String>,
    /// Bumped on every stored write
    #[serde(default)]
    pub version: u64,
}

impl WorkflowContext {
    /// Build a fresh, unsaved context
    pub fn new(
        task_id: impl Into<String>,
        workflow_type: impl Into<String>,
        shared_data: Payload,
        metadata: Payload,
        ttl: Option<Duration>,
    ) -> Self {
        let now = Utc::now();
        Self {
            context_id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            workflow_type: workflow_type.into(),
            shared_data,
            metadata,
            status: ContextStatus::Active,
            created_at: now,
            updated_at: now,
            expires_at: ttl.and_then(|ttl| expiry_after(now, ttl)),
            participants: BTreeSet::new(),
            version: 0,
        }
    }

    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.shared_data.get(key)
    }

    /// Typed read of one shared value
    pub fn get_as<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.shared_data.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    /// Set one key on this copy; persisted by the next store write
    pub fn set_value(&mut self, key: impl Into<String>, value: Value) {
        self.shared_data.insert(key.into(), value);
    }

    pub fn update_values(&mut self, values: Payload) {
        self.shared_data.extend(values);
    }

    pub fn remove_value(&mut self, key: &str) -> Option<Value> {
        self.shared_data.remove(key)
    }

    pub fn add_participant(&mut self, agent_id: impl Into<String>) {
        self.participants.insert(agent_id.into());
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.map_or(false, |at| Utc::now() >= at)
    }

    /// Remaining lifetime; `None` when the context never expires
    pub fn remaining_ttl(&self) -> Option<Duration> {
        self.expires_at
            .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
    }

    /// Push the expiry out to `ttl` from now
    pub fn extend_ttl(&mut self, ttl: Duration) {
        self.expires_at = expiry_after(Utc::now(), ttl);
    }

    pub fn mark_completed(&mut self) -> Result<()> {
        self.transition(ContextStatus::Completed)
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(ContextStatus::Failed)?;
        self.metadata
            .insert("failure_reason".into(), Value::String(reason.into()));
        Ok(())
    }

    pub fn mark_cancelled(&mut self) -> Result<()> {
        self.transition(ContextStatus::Cancelled)
    }

    fn transition(&mut self, to: ContextStatus) -> Result<()> {
        if self.status.is_terminal() {
            return Err(CommsError::InvalidStatusTransition {
                context_id: self.context_id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}

/// `None` when `ttl` is too large to represent, i.e. effectively never
fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
}

/// Context storage on top of the broker's key/value store
#[derive(Clone)]
pub struct ContextStore {
    store: Arc<dyn KeyValueStore>,
}

impl ContextStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn key(context_id: &str) -> String {
        format!("{}{}", CONTEXT_PREFIX, context_id)
    }

    /// Create and persist a new active context
    pub async fn create(
        &self,
        task_id: &str,
        workflow_type: &str,
        shared_data: Payload,
        metadata: Payload,
        ttl: Option<Duration>,
    ) -> Result<WorkflowContext> {
        let mut context = WorkflowContext::new(task_id, workflow_type, shared_data, metadata, ttl);
        self.save(&mut context).await?;
        tracing::debug!(
            context_id = %context.context_id,
            task_id,
            workflow_type,
            "Created context"
        );
        Ok(context)
    }

    /// Write the whole record, keeping its expiry
    ///
    /// Bumps `version` and `updated_at` on the caller's copy so it matches
    /// what was stored. No read happens first; a concurrent write is lost.
    pub async fn save(&self, context: &mut WorkflowContext) -> Result<()> {
        let previous = (context.version, context.updated_at);
        context.version += 1;
        context.updated_at = Utc::now();
        let written = self.write(context).await;
        if written.is_err() {
            (context.version, context.updated_at) = previous;
        }
        written
    }

    /// Blind whole-record overwrite; alias of [`save`](Self::save)
    pub async fn update(&self, context: &mut WorkflowContext) -> Result<()> {
        self.save(context).await
    }

    /// Compare-and-swap against the version the caller last read
    ///
    /// Succeeds only if the stored record still has `context.version`.
    pub async fn update_if_version(&self, context: &mut WorkflowContext) -> Result<()> {
        let key = Self::key(&context.context_id);
        let raw = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| CommsError::ContextNotFound(context.context_id.clone()))?;
        let stored: WorkflowContext = serde_json::from_str(&raw)?;
        if stored.is_expired() {
            return Err(CommsError::ContextNotFound(context.context_id.clone()));
        }
        if stored.version != context.version {
            return Err(CommsError::ContextConflict {
                context_id: context.context_id.clone(),
                expected: context.version,
                found: stored.version,
            });
        }

        let mut next = context.clone();
        next.version += 1;
        next.updated_at = Utc::now();
        let swapped = self
            .store
            .compare_and_set(
                &key,
                Some(raw.as_str()),
                serde_json::to_string(&next)?,
                next.remaining_ttl(),
            )
            .await?;
        if !swapped {
            let found = self.get(&context.context_id).await?.version;
            return Err(CommsError::ContextConflict {
                context_id: context.context_id.clone(),
                expected: context.version,
                found,
            });
        }
        *context = next;
        Ok(())
    }

    async fn write(&self, context: &WorkflowContext) -> Result<()> {
        let raw = serde_json::to_string(context)?;
        self.store
            .set(&Self::key(&context.context_id), raw, context.remaining_ttl())
            .await
    }

    /// Fetch a context; expired ones are reported as not found
    pub async fn get(&self, context_id: &str) -> Result<WorkflowContext> {
        let raw = self
            .store
            .get(&Self::key(context_id))
            .await?
            .ok_or_else(|| CommsError::ContextNotFound(context_id.to_string()))?;
        let context: WorkflowContext = serde_json::from_str(&raw)?;
        if context.is_expired() {
            return Err(CommsError::ContextNotFound(context_id.to_string()));
        }
        Ok(context)
    }

    /// Returns whether a live context was removed
    pub async fn delete(&self, context_id: &str) -> Result<bool> {
        let removed = self.store.delete(&Self::key(context_id)).await?;
        tracing::debug!(context_id, removed, "Deleted context");
        Ok(removed)
    }

    /// IDs of live contexts whose id matches a glob pattern
    pub async fn list(&self, pattern: &str) -> Result<Vec<String>> {
        let keys = self
            .store
            .keys(&format!("{}{}", CONTEXT_PREFIX, pattern))
            .await?;
        Ok(keys
            .into_iter()
            .filter_map(|key| key.strip_prefix(CONTEXT_PREFIX).map(str::to_string))
            .collect())
    }

    /// Delete every expired context; returns how many were removed
    pub async fn sweep(&self) -> Result<usize> {
        let removed = self
            .store
            .purge_expired(&format!("{}*", CONTEXT_PREFIX))
            .await?;
        if removed > 0 {
            tracing::debug!(removed, "Swept expired contexts");
        }
        Ok(removed)
    }

    /// Number of live contexts
    pub async fn count(&self) -> Result<usize> {
        Ok(self.list("*").await?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{payload, InProcessBackend};
    use serde_json::json;

    fn store() -> ContextStore {
        ContextStore::new(Arc::new(InProcessBackend::new()))
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let contexts = store();
        let created = contexts
            .create(
                "task-1",
                "candidate_screening",
                payload(json!({"cv_id": 7})),
                Payload::new(),
                Some(Duration::from_secs(60)),
            )
            .await
            .unwrap();

        let loaded = contexts.get(&created.context_id).await.unwrap();
        assert_eq!(loaded, created);
        assert_eq!(loaded.status, ContextStatus::Active);
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.get_as::<u32>("cv_id").unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_zero_ttl_is_not_found() {
        let contexts = store();
        let created = contexts
            .create("t", "w", Payload::new(), Payload::new(), Some(Duration::ZERO))
            .await
            .unwrap();

        let result = contexts.get(&created.context_id).await;
        assert!(matches!(result, Err(CommsError::ContextNotFound(_))));
    }

    #[tokio::test]
    async fn test_update_overwrites_whole_record() {
        let contexts = store();
        let created = contexts
            .create("t", "w", payload(json!({"a": 1, "b": 2})), Payload::new(), None)
            .await
            .unwrap();

        let mut copy = created.clone();
        copy.remove_value("b");
        copy.set_value("c", json!(3));
        copy.add_participant("scorer");
        contexts.update(&mut copy).await.unwrap();

        let loaded = contexts.get(&created.context_id).await.unwrap();
        assert_eq!(loaded.shared_data, payload(json!({"a": 1, "c": 3})));
        assert!(loaded.participants.contains("scorer"));
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded, copy);
    }

    #[tokio::test]
    async fn test_update_keeps_expiry() {
        let contexts = store();
        let created = contexts
            .create("t", "w", Payload::new(), Payload::new(), Some(Duration::from_secs(120)))
            .await
            .unwrap();

        let mut copy = created.clone();
        copy.set_value("k", json!("v"));
        contexts.update(&mut copy).await.unwrap();

        let loaded = contexts.get(&created.context_id).await.unwrap();
        assert_eq!(loaded.expires_at, created.expires_at);
    }

    #[tokio::test]
    async fn test_versioned_update_detects_conflict() {
        let contexts = store();
        let created = contexts
            .create("t", "w", Payload::new(), Payload::new(), None)
            .await
            .unwrap();

        let mut first = created.clone();
        let mut second = created.clone();
        first.set_value("by", json!("first"));
        second.set_value("by", json!("second"));

        contexts.update_if_version(&mut first).await.unwrap();
        let err = contexts.update_if_version(&mut second).await.unwrap_err();
        assert!(matches!(
            err,
            CommsError::ContextConflict { expected: 1, found: 2, .. }
        ));

        let loaded = contexts.get(&created.context_id).await.unwrap();
        assert_eq!(loaded.shared_data["by"], "first");
    }

    #[tokio::test]
    async fn test_terminal_status_only_once() {
        let mut context = WorkflowContext::new("t", "w", Payload::new(), Payload::new(), None);
        context.mark_completed().unwrap();
        assert!(context.status.is_terminal());

        let err = context.mark_failed("late").unwrap_err();
        assert!(matches!(err, CommsError::InvalidStatusTransition { .. }));
        assert_eq!(context.status, ContextStatus::Completed);
    }

    #[tokio::test]
    async fn test_list_pattern_and_delete() {
        let contexts = store();
        let a = contexts
            .create("t", "w", Payload::new(), Payload::new(), None)
            .await
            .unwrap();
        let b = contexts
            .create("t", "w", Payload::new(), Payload::new(), None)
            .await
            .unwrap();

        let all = contexts.list("*").await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.contains(&a.context_id));

        let only_b = contexts.list(&b.context_id).await.unwrap();
        assert_eq!(only_b, vec![b.context_id.clone()]);

        assert!(contexts.delete(&a.context_id).await.unwrap());
        assert_eq!(contexts.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sweep_removes_expired() {
        let contexts = store();
        contexts
            .create("t", "w", Payload::new(), Payload::new(), Some(Duration::ZERO))
            .await
            .unwrap();
        contexts
            .create("t", "w", Payload::new(), Payload::new(), None)
            .await
            .unwrap();

        assert_eq!(contexts.sweep().await.unwrap(), 1);
        assert_eq!(contexts.count().await.unwrap(), 1);
    }

    #[test]
    fn test_context_serialization_roundtrip() {
        let mut context = WorkflowContext::new(
            "task-ü",
            "interview_prep",
            payload(json!({"questions": [{"q": "¿Por qué?", "weight": 0.25}], "done": false, "n": null})),
            payload(json!({"source": "api"})),
            Some(Duration::from_secs(30)),
        );
        context.add_participant("questionnaire");

        let raw = serde_json::to_string(&context).unwrap();
        let back: WorkflowContext = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, context);
    }
}
