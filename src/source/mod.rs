//! Declarative cluster state ("root source")
//!
//! The root source is a hierarchical document describing clusters, their
//! nodes and the containers those nodes run, with enough of each create
//! spec to rebuild the fleet. Export walks the live registries; import
//! applies the document as concrete mutations: cluster creation, node
//! attachment and container creation on the owning daemons. JSON and YAML
//! renditions are equivalent.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::containers::{
    unique_container_name, ContainerBase, ContainerRegistration, ContainerRegistry,
};
use crate::discovery::{ClusterConfig, DiscoveryStorage};
use crate::docker::{ContainerSpec, HostConfig, ImageRef, PortBinding};
use crate::error::{ControlError, Result};
use crate::node::NodeRegistry;

/// The whole control plane's desired state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RootSource {
    #[serde(default)]
    pub clusters: Vec<ClusterSource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSource {
    #[serde(flatten)]
    pub config: ClusterConfig,
    #[serde(default)]
    pub nodes: Vec<NodeSource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSource {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub containers: Vec<ContainerSource>,
}

/// One container's create spec, in document form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSource {
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortMapping>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

impl ContainerSource {
    pub fn from_registration(registration: &ContainerRegistration) -> Self {
        Self {
            name: registration.name.clone(),
            image: registration.image.clone(),
            labels: registration.labels.clone(),
            env: None,
            memory: None,
            ports: registration
                .ports
                .iter()
                .map(|p| PortMapping {
                    container_port: p.private_port,
                    host_port: p.public_port,
                    protocol: p.protocol.clone(),
                })
                .collect(),
        }
    }

    /// Build the daemon create spec for this entry.
    pub fn to_spec(&self) -> ContainerSpec {
        let mut exposed = HashMap::new();
        let mut bindings: HashMap<String, Vec<PortBinding>> = HashMap::new();
        for port in &self.ports {
            let key = format!(
                "{}/{}",
                port.container_port,
                port.protocol.as_deref().unwrap_or("tcp")
            );
            exposed.insert(key.clone(), serde_json::json!({}));
            if let Some(host_port) = port.host_port {
                bindings.insert(
                    key,
                    vec![PortBinding {
                        host_ip: None,
                        host_port: Some(host_port.to_string()),
                    }],
                );
            }
        }

        ContainerSpec {
            image: self.image.clone(),
            cmd: None,
            env: self.env.clone(),
            labels: if self.labels.is_empty() {
                None
            } else {
                Some(self.labels.clone())
            },
            exposed_ports: if exposed.is_empty() {
                None
            } else {
                Some(exposed)
            },
            host_config: if self.memory.is_none() && bindings.is_empty() {
                None
            } else {
                Some(HostConfig {
                    memory: self.memory,
                    port_bindings: if bindings.is_empty() {
                        None
                    } else {
                        Some(bindings)
                    },
                    ..Default::default()
                })
            },
        }
    }
}

/// What an import did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceApplyReport {
    pub clusters_created: usize,
    pub nodes_registered: usize,
    pub containers_created: usize,
    pub containers_skipped: usize,
    pub failures: Vec<String>,
}

pub struct SourceService {
    discovery: Arc<DiscoveryStorage>,
    nodes: Arc<NodeRegistry>,
    containers: Arc<ContainerRegistry>,
}

impl SourceService {
    pub fn new(
        discovery: Arc<DiscoveryStorage>,
        nodes: Arc<NodeRegistry>,
        containers: Arc<ContainerRegistry>,
    ) -> Self {
        Self {
            discovery,
            nodes,
            containers,
        }
    }

    /// Export the full desired state from the live registries.
    pub fn get_root_source(&self) -> RootSource {
        RootSource {
            clusters: self
                .discovery
                .list()
                .into_iter()
                .map(|config| self.cluster_source(config))
                .collect(),
        }
    }

    /// Export one cluster's subtree.
    pub fn get_cluster_source(&self, cluster: &str) -> Result<ClusterSource> {
        let config = self
            .discovery
            .get_cluster(cluster)
            .ok_or_else(|| ControlError::NotFound(format!("cluster {}", cluster)))?;
        Ok(self.cluster_source(config))
    }

    fn cluster_source(&self, config: ClusterConfig) -> ClusterSource {
        let nodes = self
            .nodes
            .list_by_cluster(&config.name)
            .into_iter()
            .map(|node| NodeSource {
                containers: self
                    .containers
                    .list_by_node(&node.name)
                    .iter()
                    .map(ContainerSource::from_registration)
                    .collect(),
                name: node.name,
                address: node.address,
            })
            .collect();
        ClusterSource { config, nodes }
    }

    /// Apply a root source document. Failures on individual containers are
    /// recorded and do not abort the rest of the import.
    pub async fn set_root_source(&self, source: &RootSource) -> Result<SourceApplyReport> {
        let mut report = SourceApplyReport::default();
        for cluster in &source.clusters {
            self.apply_cluster(cluster, &mut report).await;
        }
        info!(
            "Applied root source: {} clusters created, {} nodes, {} containers created, {} skipped, {} failures",
            report.clusters_created,
            report.nodes_registered,
            report.containers_created,
            report.containers_skipped,
            report.failures.len()
        );
        Ok(report)
    }

    /// Apply one cluster subtree.
    pub async fn set_cluster_source(&self, source: &ClusterSource) -> Result<SourceApplyReport> {
        let mut report = SourceApplyReport::default();
        self.apply_cluster(source, &mut report).await;
        Ok(report)
    }

    async fn apply_cluster(&self, cluster: &ClusterSource, report: &mut SourceApplyReport) {
        let name = cluster.config.name.clone();
        let existed = self.discovery.get_cluster(&name).is_some();
        self.discovery
            .get_or_create_cluster(cluster.config.clone())
            .await;
        if !existed {
            report.clusters_created += 1;
        }

        let image_filter = cluster
            .config
            .image_filter
            .as_deref()
            .and_then(|expr| match glob::Pattern::new(expr) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!("Cluster {} has a bad image filter {}: {}", name, expr, e);
                    None
                }
            });

        for node in &cluster.nodes {
            self.nodes.register(&node.name, &node.address).await;
            report.nodes_registered += 1;
            if let Err(e) = self
                .discovery
                .set_node_cluster(&node.name, Some(name.clone()))
                .await
            {
                report
                    .failures
                    .push(format!("attach node {} to {}: {}", node.name, name, e));
            }

            for container in &node.containers {
                if let Some(pattern) = &image_filter {
                    if !pattern.matches(&container.image) {
                        report.failures.push(format!(
                            "{}/{}: image {} is not allowed in cluster {}",
                            node.name, container.name, container.image, name
                        ));
                        continue;
                    }
                }
                match self.apply_container(&node.name, container).await {
                    Ok(true) => report.containers_created += 1,
                    Ok(false) => report.containers_skipped += 1,
                    Err(e) => {
                        warn!(
                            "Import of {}/{} failed: {}",
                            node.name, container.name, e
                        );
                        report
                            .failures
                            .push(format!("{}/{}: {}", node.name, container.name, e));
                    }
                }
            }
        }
    }

    /// Create one container unless a registration with the same fleet name
    /// already exists. Entries without a name get one allocated from the
    /// image name. Returns whether a container was created.
    async fn apply_container(&self, node: &str, container: &ContainerSource) -> Result<bool> {
        let service = self.discovery.get_node_service(node)?;
        let image = ImageRef::parse(&container.image);

        let name = if container.name.trim().is_empty() {
            let base = image.name.rsplit('/').next().unwrap_or("container");
            unique_container_name(&service, base).await?
        } else {
            container.name.clone()
        };
        if self.containers.find(&format!("{}/{}", node, name)).is_some() {
            return Ok(false);
        }

        let cancel = CancellationToken::new();
        service.pull_image(&image, None, &cancel).await?;

        let spec = container.to_spec();
        let created = service.create_container(&spec, Some(&name)).await?;
        service.start_container(&created.id).await?;

        self.containers
            .get_or_create(
                &ContainerBase {
                    id: created.id,
                    name,
                    image: container.image.clone(),
                    image_id: None,
                },
                node,
            )
            .await;
        Ok(true)
    }
}

/// YAML rendition of a root source.
pub fn to_yaml(source: &RootSource) -> Result<String> {
    serde_yaml::to_string(source)
        .map_err(|e| ControlError::Internal(format!("encode root source: {}", e)))
}

/// Parse a YAML root source.
pub fn from_yaml(text: &str) -> Result<RootSource> {
    serde_yaml::from_str(text)
        .map_err(|e| ControlError::Validation(format!("parse root source: {}", e)))
}
