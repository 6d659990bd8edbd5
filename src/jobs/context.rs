//! Job execution context
//!
//! The context threads everything a handler may touch: its instance (for
//! progress and cancellation) and the control plane services, resolved
//! once at job start and passed down explicitly. The cluster scope is
//! resolved from the `cluster` parameter; a missing or unknown cluster
//! yields no scope, and tasklets that need one fail themselves, not the
//! job machinery.

use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::debug;

use crate::config::UpdateConfiguration;
use crate::containers::{ContainerRegistration, ContainerRegistry};
use crate::discovery::{ClusterService, DiscoveryStorage};
use crate::docker::RegistryClient;
use crate::events::EventBus;
use crate::node::NodeRegistry;
use crate::version::VersionComparator;

use super::definition::JobParameters;
use super::instance::JobInstance;
use super::manager::JobManager;

/// Control-plane services handed to every job.
#[derive(Clone)]
pub struct JobServices {
    pub discovery: Arc<DiscoveryStorage>,
    pub nodes: Arc<NodeRegistry>,
    pub containers: Arc<ContainerRegistry>,
    pub events: Arc<EventBus>,
    pub comparator: Arc<VersionComparator>,
    pub registries: Arc<Vec<RegistryClient>>,
    pub update_config: Arc<UpdateConfiguration>,
    manager: Arc<RwLock<Weak<JobManager>>>,
}

impl JobServices {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        discovery: Arc<DiscoveryStorage>,
        nodes: Arc<NodeRegistry>,
        containers: Arc<ContainerRegistry>,
        events: Arc<EventBus>,
        comparator: Arc<VersionComparator>,
        registries: Arc<Vec<RegistryClient>>,
        update_config: Arc<UpdateConfiguration>,
    ) -> Self {
        Self {
            discovery,
            nodes,
            containers,
            events,
            comparator,
            registries,
            update_config,
            manager: Arc::new(RwLock::new(Weak::new())),
        }
    }

    /// Wire the manager in after construction; jobs that emit other jobs
    /// resolve it through this weak link.
    pub fn set_manager(&self, manager: &Arc<JobManager>) {
        *self.manager.write() = Arc::downgrade(manager);
    }

    pub fn manager(&self) -> Option<Arc<JobManager>> {
        self.manager.read().upgrade()
    }

    /// All containers currently registered under a cluster's nodes.
    pub fn cluster_containers(&self, cluster: &str) -> Vec<ContainerRegistration> {
        self.nodes
            .list_by_cluster(cluster)
            .into_iter()
            .flat_map(|node| self.containers.list_by_node(&node.name))
            .collect()
    }
}

/// The endpoint scope a job runs against.
pub struct ClusterScope {
    pub cluster: String,
    pub service: ClusterService,
}

pub struct JobContext {
    pub instance: Arc<JobInstance>,
    pub services: JobServices,
}

impl JobContext {
    pub fn new(instance: Arc<JobInstance>, services: JobServices) -> Self {
        Self { instance, services }
    }

    /// Report a human-readable progress line.
    pub fn fire(&self, line: impl Into<String>) {
        let line = line.into();
        debug!("job {}: {}", self.instance.id, line);
        self.instance.fire(line);
    }

    pub fn params(&self) -> &JobParameters {
        &self.instance.parameters
    }

    pub fn is_cancelled(&self) -> bool {
        self.instance.is_cancel_requested()
    }

    pub fn cancel_token(&self) -> tokio_util::sync::CancellationToken {
        self.instance.cancel_token()
    }

    /// Resolve the cluster scope from the `cluster` parameter. `None` when
    /// the parameter is absent, malformed, or names no known cluster.
    pub fn scope(&self) -> Option<ClusterScope> {
        let cluster = self.params().get_str("cluster").ok().flatten()?;
        match self.services.discovery.get_service(&cluster) {
            Ok(service) => Some(ClusterScope { cluster, service }),
            Err(e) => {
                debug!("job {}: no scope: {}", self.instance.id, e);
                None
            }
        }
    }
}
