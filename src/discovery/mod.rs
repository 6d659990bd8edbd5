//! Discovery storage
//!
//! Owns the cluster registry: named groups of nodes, their configuration
//! and features, and the endpoint clients that front them. A Swarm cluster
//! is fronted by one aggregate orchestrator client built from its
//! configured hosts; a plain group's service is synthesized from its
//! member nodes' clients. Data carries names only; clients are resolved
//! through the registries at use sites.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::DockerConfiguration;
use crate::docker::{DockerService, EndpointAddress, EndpointConfig};
use crate::error::{ControlError, Result};
use crate::events::{BusEvent, ClusterEvent, ClusterEventKind, EventBus, TOPIC_CLUSTER_EVENTS};
use crate::kv::{self, KvStore};
use crate::node::{NodeRecord, NodeRegistry};

/// Cluster feature flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterFeature {
    /// The cluster is fronted by an aggregate orchestrator endpoint.
    Swarm,
    /// Nodes may not be attached to this cluster.
    ForbidNodeAddition,
}

/// Persisted cluster configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Glob restricting which images this cluster's containers may run.
    #[serde(default)]
    pub image_filter: Option<String>,
    #[serde(default)]
    pub features: Vec<ClusterFeature>,
    /// Aggregate endpoint hosts (Swarm clusters only).
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Registries containers of this cluster may pull from.
    #[serde(default)]
    pub registries: Vec<String>,
    #[serde(default)]
    pub docker_timeout_s: Option<u64>,
    #[serde(default)]
    pub cache_ttl_s: Option<u64>,
    /// Child group names; non-empty only for logical aggregates.
    #[serde(default)]
    pub children: Vec<String>,
}

impl ClusterConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: None,
            description: None,
            image_filter: None,
            features: Vec::new(),
            hosts: Vec::new(),
            registries: Vec::new(),
            docker_timeout_s: None,
            cache_ttl_s: None,
            children: Vec::new(),
        }
    }

    pub fn has_feature(&self, feature: ClusterFeature) -> bool {
        self.features.contains(&feature)
    }

    pub fn is_swarm(&self) -> bool {
        self.has_feature(ClusterFeature::Swarm)
    }
}

/// The endpoint client(s) fronting a cluster.
#[derive(Clone)]
pub enum ClusterService {
    /// A Swarm cluster's aggregate orchestrator client.
    Aggregate(Arc<DockerService>),
    /// A plain group: one client per member node.
    PerNode(Vec<Arc<DockerService>>),
}

impl ClusterService {
    /// All clients, one for an aggregate, per-node otherwise.
    pub fn all(&self) -> Vec<Arc<DockerService>> {
        match self {
            ClusterService::Aggregate(service) => vec![service.clone()],
            ClusterService::PerNode(services) => services.clone(),
        }
    }

    pub fn aggregate(&self) -> Option<Arc<DockerService>> {
        match self {
            ClusterService::Aggregate(service) => Some(service.clone()),
            ClusterService::PerNode(_) => None,
        }
    }
}

struct CachedNodeService {
    address: String,
    service: Arc<DockerService>,
}

pub struct DiscoveryStorage {
    clusters: DashMap<String, ClusterConfig>,
    aggregate_services: DashMap<String, Arc<DockerService>>,
    node_services: DashMap<String, CachedNodeService>,
    kv: Arc<dyn KvStore>,
    prefix: String,
    events: Arc<EventBus>,
    nodes: Arc<NodeRegistry>,
    defaults: DockerConfiguration,
}

impl DiscoveryStorage {
    pub fn new(
        kv: Arc<dyn KvStore>,
        prefix: impl Into<String>,
        events: Arc<EventBus>,
        nodes: Arc<NodeRegistry>,
        defaults: DockerConfiguration,
    ) -> Self {
        Self {
            clusters: DashMap::new(),
            aggregate_services: DashMap::new(),
            node_services: DashMap::new(),
            kv,
            prefix: prefix.into(),
            events,
            nodes,
            defaults,
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}/clusters/{}", self.prefix, name)
    }

    fn publish(&self, cluster: &str, kind: ClusterEventKind) {
        self.events.publish(
            TOPIC_CLUSTER_EVENTS,
            BusEvent::Cluster(ClusterEvent {
                cluster: cluster.to_string(),
                kind,
            }),
        );
    }

    async fn flush(&self, config: &ClusterConfig) {
        if let Err(e) = kv::put_json(self.kv.as_ref(), &self.key(&config.name), config).await {
            warn!("Failed to persist cluster {}: {}", config.name, e);
        }
    }

    /// Rebuild clusters from the KV store.
    pub async fn load(&self) -> Result<usize> {
        let keys = self.kv.list(&format!("{}/clusters/", self.prefix)).await?;
        let mut loaded = 0;
        for key in keys {
            match kv::get_json::<ClusterConfig>(self.kv.as_ref(), &key).await {
                Ok(Some(config)) => {
                    self.clusters.insert(config.name.clone(), config);
                    loaded += 1;
                }
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable cluster record {}: {}", key, e),
            }
        }
        info!("Loaded {} clusters from KV", loaded);
        Ok(loaded)
    }

    pub fn get_cluster(&self, name: &str) -> Option<ClusterConfig> {
        self.clusters.get(name).map(|c| c.clone())
    }

    pub fn list(&self) -> Vec<ClusterConfig> {
        let mut all: Vec<ClusterConfig> = self.clusters.iter().map(|c| c.clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Return the cluster, creating it from `config` when absent.
    pub async fn get_or_create_cluster(&self, config: ClusterConfig) -> ClusterConfig {
        let name = config.name.clone();
        let mut created = false;
        let stored = self
            .clusters
            .entry(name.clone())
            .or_insert_with(|| {
                created = true;
                config
            })
            .clone();
        if created {
            info!("Created cluster {}", name);
            self.flush(&stored).await;
            self.publish(&name, ClusterEventKind::Created);
        }
        stored
    }

    /// Return the logical group, creating it when absent. Groups carry no
    /// aggregate endpoint, so the Swarm feature is rejected here.
    pub async fn get_or_create_group(&self, config: ClusterConfig) -> Result<ClusterConfig> {
        if config.is_swarm() {
            return Err(ControlError::Validation(format!(
                "group {} must not carry the SWARM feature",
                config.name
            )));
        }
        Ok(self.get_or_create_cluster(config).await)
    }

    /// Create or replace a cluster configuration. The aggregate client is
    /// re-materialized on next use so host or timeout changes take effect.
    pub async fn put_cluster(&self, config: ClusterConfig) -> ClusterConfig {
        let name = config.name.clone();
        let existed = self.clusters.insert(name.clone(), config.clone()).is_some();
        self.aggregate_services.remove(&name);
        self.flush(&config).await;
        if !existed {
            info!("Created cluster {}", name);
            self.publish(&name, ClusterEventKind::Created);
        }
        config
    }

    /// Delete a cluster: detach its nodes, drop its clients, remove the KV
    /// record.
    pub async fn delete_cluster(&self, name: &str) -> Result<()> {
        let (name, _config) = self
            .clusters
            .remove(name)
            .ok_or_else(|| ControlError::NotFound(format!("cluster {}", name)))?;

        for node in self.nodes.list_by_cluster(&name) {
            if let Err(e) = self.nodes.set_cluster(&node.name, None).await {
                warn!("Failed to detach node {} from {}: {}", node.name, name, e);
            }
        }
        self.aggregate_services.remove(&name);
        if let Err(e) = self.kv.delete(&self.key(&name)).await {
            warn!("Failed to delete cluster {} from KV: {}", name, e);
        }

        info!("Deleted cluster {}", name);
        self.publish(&name, ClusterEventKind::Deleted);
        Ok(())
    }

    fn endpoint_config(&self, config: &ClusterConfig, hosts: Vec<String>) -> EndpointConfig {
        EndpointConfig {
            hosts,
            docker_timeout: Duration::from_secs(
                config.docker_timeout_s.unwrap_or(self.defaults.docker_timeout_s),
            ),
            cache_ttl: Duration::from_secs(
                config.cache_ttl_s.unwrap_or(self.defaults.cache_after_write_s),
            ),
            ..Default::default()
        }
    }

    /// The endpoint client(s) for a cluster: the cached aggregate for a
    /// Swarm cluster, per-node clients for a plain group (including the
    /// nodes of its children).
    pub fn get_service(&self, name: &str) -> Result<ClusterService> {
        let config = self
            .get_cluster(name)
            .ok_or_else(|| ControlError::NotFound(format!("cluster {}", name)))?;

        if config.is_swarm() {
            if let Some(cached) = self.aggregate_services.get(name) {
                return Ok(ClusterService::Aggregate(cached.clone()));
            }
            let endpoint = self.endpoint_config(&config, config.hosts.clone());
            let service = Arc::new(DockerService::new(
                EndpointAddress::Cluster(name.to_string()),
                endpoint,
                self.events.clone(),
                Some(self.nodes.clone()),
            )?);
            self.aggregate_services
                .insert(name.to_string(), service.clone());
            return Ok(ClusterService::Aggregate(service));
        }

        let mut members = self.nodes.list_by_cluster(name);
        for child in &config.children {
            members.extend(self.nodes.list_by_cluster(child));
        }
        let mut services = Vec::with_capacity(members.len());
        for member in members {
            services.push(self.node_service(&member)?);
        }
        Ok(ClusterService::PerNode(services))
    }

    /// The endpoint client of a single node, cached until its address
    /// changes.
    pub fn get_node_service(&self, name: &str) -> Result<Arc<DockerService>> {
        let record = self
            .nodes
            .get(name)
            .ok_or_else(|| ControlError::NotFound(format!("node {}", name)))?;
        self.node_service(&record)
    }

    fn node_service(&self, record: &NodeRecord) -> Result<Arc<DockerService>> {
        if let Some(cached) = self.node_services.get(&record.name) {
            if cached.address == record.address {
                return Ok(cached.service.clone());
            }
        }
        let config = record
            .cluster
            .as_deref()
            .and_then(|c| self.get_cluster(c))
            .unwrap_or_else(|| ClusterConfig::new("default"));
        let endpoint = self.endpoint_config(&config, vec![record.address.clone()]);
        let service = Arc::new(DockerService::new(
            EndpointAddress::Node(record.name.clone()),
            endpoint,
            self.events.clone(),
            Some(self.nodes.clone()),
        )?);
        self.node_services.insert(
            record.name.clone(),
            CachedNodeService {
                address: record.address.clone(),
                service: service.clone(),
            },
        );
        Ok(service)
    }

    /// Attach a node to a cluster, or detach it with `None`. The target
    /// cluster must exist and allow additions.
    pub async fn set_node_cluster(
        &self,
        node: &str,
        cluster: Option<String>,
    ) -> Result<NodeRecord> {
        if let Some(target) = &cluster {
            let config = self
                .get_cluster(target)
                .ok_or_else(|| ControlError::NotFound(format!("cluster {}", target)))?;
            if config.has_feature(ClusterFeature::ForbidNodeAddition) {
                return Err(ControlError::Conflict(format!(
                    "cluster {} does not accept node additions",
                    target
                )));
            }
        }

        let previous = self.nodes.get(node).and_then(|r| r.cluster);
        let record = self.nodes.set_cluster(node, cluster.clone()).await?;

        // Membership changed: affected aggregates re-materialize on next use.
        if let Some(previous) = previous {
            self.aggregate_services.remove(&previous);
        }
        if let Some(cluster) = cluster {
            self.aggregate_services.remove(&cluster);
        }
        Ok(record)
    }
}
