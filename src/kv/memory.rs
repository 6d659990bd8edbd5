//! In-memory KV backend, used by tests and single-process setups.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use super::{KvChange, KvResult, KvStore};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.map(|at| at > Instant::now()).unwrap_or(true)
    }
}

pub struct MemoryKv {
    entries: RwLock<BTreeMap<String, Entry>>,
    changes: broadcast::Sender<KvChange>,
}

impl MemoryKv {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(1024);
        Self {
            entries: RwLock::new(BTreeMap::new()),
            changes,
        }
    }

    fn notify(&self, change: KvChange) {
        let _ = self.changes.send(change);
    }

    fn insert(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let entry = Entry {
            value: value.to_string(),
            expires_at: ttl.map(|t| Instant::now() + t),
        };
        self.entries.write().insert(key.to_string(), entry);
        self.notify(KvChange::Put {
            key: key.to_string(),
            value: value.to_string(),
        });
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let entries = self.entries.read();
        Ok(entries
            .get(key)
            .filter(|e| e.live())
            .map(|e| e.value.clone()))
    }

    async fn put(&self, key: &str, value: &str) -> KvResult<()> {
        self.insert(key, value, None);
        Ok(())
    }

    async fn put_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> KvResult<()> {
        self.insert(key, value, Some(ttl));
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> KvResult<bool> {
        let swapped = {
            let mut entries = self.entries.write();
            let current = entries.get(key).filter(|e| e.live()).map(|e| e.value.as_str());
            if current == expected {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: value.to_string(),
                        expires_at: None,
                    },
                );
                true
            } else {
                false
            }
        };
        if swapped {
            self.notify(KvChange::Put {
                key: key.to_string(),
                value: value.to_string(),
            });
        }
        Ok(swapped)
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        let removed = self.entries.write().remove(key).is_some();
        if removed {
            self.notify(KvChange::Delete {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> KvResult<()> {
        let removed: Vec<String> = {
            let mut entries = self.entries.write();
            let keys: Vec<String> = entries
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, _)| k.clone())
                .collect();
            for key in &keys {
                entries.remove(key);
            }
            keys
        };
        for key in removed {
            self.notify(KvChange::Delete { key });
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> KvResult<Vec<String>> {
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, e)| e.live())
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn watch(&self) -> broadcast::Receiver<KvChange> {
        self.changes.subscribe()
    }
}
