//! Online-status store.
//!
//! The registry mirrors online/offline state into an external key/value
//! store, keyed by endpoint local part. The store is best-effort: routing
//! never depends on it, and failures are only logged.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

mod redis_store;

pub use redis_store::RedisStatusStore;

/// Error type for status store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store operation failed: {0}")]
    Operation(String),
}

/// Key/value store used to record which endpoints are online.
///
/// Implementations can be in-memory (single node) or backed by a shared
/// cache for clustered deployments.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Ensure a connection to the backing store.
    async fn connect(&self) -> Result<(), StoreError>;

    /// Number of existing keys matching `key` (0 or 1).
    async fn exists_key(&self, key: &str) -> Result<i64, StoreError>;

    /// Set `key` to `value`, expiring after `ttl` when given.
    async fn set_data(&self, key: &str, value: &str, ttl: Option<Duration>)
        -> Result<(), StoreError>;

    /// Delete `key`.
    async fn del_data(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-memory implementation of the status store.
#[derive(Debug, Default)]
pub struct InMemoryStatusStore {
    entries: DashMap<String, StoredValue>,
}

impl InMemoryStatusStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a value, ignoring expired entries.
    pub fn get(&self, key: &str) -> Option<String> {
        self.entries
            .get(key)
            .filter(|v| !v.is_expired())
            .map(|v| v.value.clone())
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|v| !v.is_expired()).count()
    }

    /// Whether the store has no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StatusStore for InMemoryStatusStore {
    async fn connect(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn exists_key(&self, key: &str) -> Result<i64, StoreError> {
        self.entries.remove_if(key, |_, v| v.is_expired());
        Ok(i64::from(self.entries.contains_key(key)))
    }

    async fn set_data(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let expires_at = ttl.filter(|t| !t.is_zero()).map(|t| Instant::now() + t);
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at,
            },
        );
        debug!(key = %key, "Stored status entry");
        Ok(())
    }

    async fn del_data(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        debug!(key = %key, "Deleted status entry");
        Ok(())
    }
}
