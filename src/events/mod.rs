//! In-process event bus and event types
//!
//! Everything observable in the fleet flows through here: endpoint
//! availability flips, node arrivals, container lifecycle events decoded
//! from daemon streams, cluster CRUD and job progress. Delivery is FIFO
//! within a topic; nothing is promised across topics.

mod bus;

pub use bus::EventBus;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Topic carrying node registration, health and cluster-assignment events.
pub const TOPIC_NODE_EVENTS: &str = "node-events";

/// Topic carrying container lifecycle events from all endpoints.
pub const TOPIC_CONTAINER_EVENTS: &str = "container-events";

/// Topic carrying cluster create/delete events.
pub const TOPIC_CLUSTER_EVENTS: &str = "cluster-events";

/// Per-endpoint topic: online/offline/info changes for one docker service.
pub fn service_topic(endpoint: &str) -> String {
    format!("docker-service.{}", endpoint)
}

/// Per-instance topic: progress and status of one job.
pub fn job_topic(instance_id: &str) -> String {
    format!("job.{}", instance_id)
}

/// Availability and info events for a single endpoint client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceEventKind {
    Online,
    Offline,
    InfoChanged,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEvent {
    /// Endpoint identity (cluster or node name).
    pub endpoint: String,
    pub kind: ServiceEventKind,
    /// Error text for offline flips.
    pub message: Option<String>,
    pub time: DateTime<Utc>,
}

impl ServiceEvent {
    pub fn new(endpoint: impl Into<String>, kind: ServiceEventKind) -> Self {
        Self {
            endpoint: endpoint.into(),
            kind,
            message: None,
            time: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Node registry events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeEventKind {
    Registered,
    HealthUpdated,
    ClusterChanged,
    Removed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEvent {
    pub node: String,
    pub kind: NodeEventKind,
    /// Cluster the node moved to, for cluster-change events.
    pub cluster: Option<String>,
}

/// A container lifecycle event, normalized from a daemon event frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerEvent {
    /// Container ID, when the daemon reported one.
    pub id: Option<String>,
    /// Node the event was observed on.
    pub node: String,
    /// Daemon action: create, start, stop, die, destroy, ...
    pub action: String,
    pub image: Option<String>,
    pub time: DateTime<Utc>,
}

/// Cluster lifecycle events from discovery storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterEventKind {
    Created,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub cluster: String,
    pub kind: ClusterEventKind,
}

/// Progress or status change of a job instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub job: String,
    /// Human-readable progress line, when this is a progress event.
    pub line: Option<String>,
    /// New status as a display string, when this is a status event.
    pub status: Option<String>,
}

/// Union of everything the bus carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    Service(ServiceEvent),
    Node(NodeEvent),
    Container(ContainerEvent),
    Cluster(ClusterEvent),
    Job(JobEvent),
}
