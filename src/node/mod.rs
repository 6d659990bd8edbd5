//! Node registry
//!
//! The set of known container-hosting nodes: endpoint address, cluster
//! assignment and the last health snapshot their agent reported. Records
//! are written through to the KV store and rebuilt from it at startup;
//! cluster-feature validation happens one level up in discovery storage.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ControlError, Result};
use crate::events::{BusEvent, EventBus, NodeEvent, NodeEventKind, TOPIC_NODE_EVENTS};
use crate::kv::{self, KvStore};

/// Agent-reported health snapshot. Every field is optional; absent values
/// are filled from daemon info where possible.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeHealth {
    /// When the agent produced this snapshot.
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sys_cpu_jiffies: Option<u64>,
    #[serde(default)]
    pub memory_total: Option<u64>,
    #[serde(default)]
    pub healthy: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub name: String,
    /// Daemon endpoint address, host:port.
    pub address: String,
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub health: NodeHealth,
}

pub struct NodeRegistry {
    nodes: DashMap<String, NodeRecord>,
    kv: Arc<dyn KvStore>,
    prefix: String,
    events: Arc<EventBus>,
}

impl NodeRegistry {
    pub fn new(kv: Arc<dyn KvStore>, prefix: impl Into<String>, events: Arc<EventBus>) -> Self {
        Self {
            nodes: DashMap::new(),
            kv,
            prefix: prefix.into(),
            events,
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}/nodes/{}", self.prefix, name)
    }

    fn publish(&self, node: &str, kind: NodeEventKind, cluster: Option<String>) {
        self.events.publish(
            TOPIC_NODE_EVENTS,
            BusEvent::Node(NodeEvent {
                node: node.to_string(),
                kind,
                cluster,
            }),
        );
    }

    async fn flush(&self, record: &NodeRecord) {
        let key = self.key(&record.name);
        if let Err(e) = kv::put_json(self.kv.as_ref(), &key, record).await {
            // Keep the in-memory mutation; the next reconciliation re-flushes.
            warn!("Failed to persist node {}: {}", record.name, e);
        }
    }

    /// Rebuild the registry from the KV store.
    pub async fn load(&self) -> Result<usize> {
        let keys = self.kv.list(&format!("{}/nodes/", self.prefix)).await?;
        let mut loaded = 0;
        for key in keys {
            match kv::get_json::<NodeRecord>(self.kv.as_ref(), &key).await {
                Ok(Some(record)) => {
                    self.nodes.insert(record.name.clone(), record);
                    loaded += 1;
                }
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable node record {}: {}", key, e),
            }
        }
        info!("Loaded {} nodes from KV", loaded);
        Ok(loaded)
    }

    /// Create or update a node on (re-)registration.
    pub async fn register(&self, name: &str, address: &str) -> NodeRecord {
        let record = {
            let mut entry = self.nodes.entry(name.to_string()).or_insert_with(|| {
                debug!("New node {} at {}", name, address);
                NodeRecord {
                    name: name.to_string(),
                    address: address.to_string(),
                    cluster: None,
                    health: NodeHealth::default(),
                }
            });
            entry.address = address.to_string();
            entry.clone()
        };
        self.flush(&record).await;
        self.publish(name, NodeEventKind::Registered, record.cluster.clone());
        record
    }

    /// Ingest an agent health report.
    pub async fn update_health(&self, name: &str, health: NodeHealth) -> Result<()> {
        let record = {
            let mut entry = self
                .nodes
                .get_mut(name)
                .ok_or_else(|| ControlError::NotFound(format!("node {}", name)))?;
            entry.health = health;
            entry.clone()
        };
        self.flush(&record).await;
        self.publish(name, NodeEventKind::HealthUpdated, None);
        Ok(())
    }

    /// Reassign a node to a cluster (or detach it with `None`).
    pub async fn set_cluster(&self, name: &str, cluster: Option<String>) -> Result<NodeRecord> {
        let record = {
            let mut entry = self
                .nodes
                .get_mut(name)
                .ok_or_else(|| ControlError::NotFound(format!("node {}", name)))?;
            entry.cluster = cluster.clone();
            entry.clone()
        };
        self.flush(&record).await;
        self.publish(name, NodeEventKind::ClusterChanged, cluster);
        Ok(record)
    }

    pub async fn remove(&self, name: &str) -> Result<()> {
        if let Err(e) = self.kv.delete(&self.key(name)).await {
            warn!("Failed to delete node {} from KV: {}", name, e);
        }
        let removed = self.nodes.remove(name);
        if removed.is_none() {
            return Err(ControlError::NotFound(format!("node {}", name)));
        }
        self.publish(name, NodeEventKind::Removed, None);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<NodeRecord> {
        self.nodes.get(name).map(|r| r.clone())
    }

    pub fn list(&self) -> Vec<NodeRecord> {
        let mut records: Vec<NodeRecord> = self.nodes.iter().map(|r| r.clone()).collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    pub fn list_by_cluster(&self, cluster: &str) -> Vec<NodeRecord> {
        let mut records: Vec<NodeRecord> = self
            .nodes
            .iter()
            .filter(|r| r.cluster.as_deref() == Some(cluster))
            .map(|r| r.clone())
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    pub fn count(&self) -> usize {
        self.nodes.len()
    }
}
