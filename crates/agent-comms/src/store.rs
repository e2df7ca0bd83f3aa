//! Key/value seam for broker-held records (directory, contexts)

use async_trait::async_trait;
use std::time::Duration;

use crate::Result;

/// Shared record store with per-key expiry
///
/// Writes are whole-value: a `set` either replaces the stored value entirely
/// or fails, never leaving a partial record. Expired keys read as absent.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Store `value` under `key`. `ttl` of `None` keeps it until deleted;
    /// a zero `ttl` makes it expire immediately.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()>;

    /// Replace the value only if the live value still equals `expected`
    /// (`None` = key must be absent). Returns whether the write happened.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<bool>;

    /// Remove the key only if its live value still equals `expected`.
    /// Returns whether the delete happened.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;

    /// Live value, `None` when missing or expired
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Returns whether a live value was removed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Live keys matching a glob pattern (`*`, `?`, `[...]`)
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Drop expired keys matching `pattern`; returns how many went away
    async fn purge_expired(&self, pattern: &str) -> Result<usize>;

    /// Get store name
    fn name(&self) -> &str;
}
