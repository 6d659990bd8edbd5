//! Key-value persistence
//!
//! The control plane treats a hierarchical KV store as its source of truth
//! across restarts: containers, clusters, nodes and job checkpoints are
//! written through under a configured prefix and reloaded at startup.
//! Backends: redis for deployments, an in-memory store for tests.

mod memory;
mod redis_store;

pub use memory::MemoryKv;
pub use redis_store::RedisKv;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::config::KvConfiguration;

/// KV store errors
#[derive(Debug, Error)]
pub enum KvError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type KvResult<T> = Result<T, KvError>;

/// A mutation observed on the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvChange {
    Put { key: String, value: String },
    Delete { key: String },
}

impl KvChange {
    pub fn key(&self) -> &str {
        match self {
            KvChange::Put { key, .. } | KvChange::Delete { key } => key,
        }
    }
}

/// Hierarchical key/value store with watch, compare-and-set and TTL
/// semantics. Keys are `/`-separated paths; values are JSON text.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> KvResult<Option<String>>;

    async fn put(&self, key: &str, value: &str) -> KvResult<()>;

    /// Put with a time-to-live after which the key silently expires.
    async fn put_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> KvResult<()>;

    /// Atomically replace `key` iff its current value equals `expected`
    /// (`None` meaning "absent"). Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> KvResult<bool>;

    async fn delete(&self, key: &str) -> KvResult<()>;

    /// Delete the whole subtree under `prefix`.
    async fn delete_prefix(&self, prefix: &str) -> KvResult<()>;

    /// List keys under `prefix`.
    async fn list(&self, prefix: &str) -> KvResult<Vec<String>>;

    /// Observe mutations. The receiver sees every change made through this
    /// store handle; callers filter by prefix.
    fn watch(&self) -> broadcast::Receiver<KvChange>;
}

/// Build the configured backend.
pub async fn connect(config: &KvConfiguration) -> KvResult<Arc<dyn KvStore>> {
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(MemoryKv::new())),
        "redis" => Ok(Arc::new(RedisKv::connect(&config.url).await?)),
        other => Err(KvError::Other(format!("unknown kv backend: {}", other))),
    }
}

/// Fetch and deserialize a JSON record.
pub async fn get_json<T: serde::de::DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> KvResult<Option<T>> {
    match store.get(key).await? {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

/// Serialize and store a JSON record.
pub async fn put_json<T: serde::Serialize>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
) -> KvResult<()> {
    let text = serde_json::to_string(value)?;
    store.put(key, &text).await
}
