//! Wire types for the daemon remote API (v1.24-era) and image references

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Image references
// ============================================================================

/// A structured image reference: `[registry/]name[:tag][@digest]`.
///
/// Two references are equal iff every component agrees; tag ordering is the
/// version comparator's business, not this type's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub registry: Option<String>,
    pub name: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageRef {
    /// Parse a docker image reference. The first path segment is a registry
    /// only when it looks like a host (contains `.` or `:`, or is
    /// `localhost`), matching the daemon's own rule.
    pub fn parse(reference: &str) -> Self {
        let (rest, digest) = match reference.split_once('@') {
            Some((r, d)) => (r, Some(d.to_string())),
            None => (reference, None),
        };

        let (rest, registry) = match rest.split_once('/') {
            Some((first, _)) if first.contains('.') || first.contains(':') || first == "localhost" => {
                let remainder = &rest[first.len() + 1..];
                (remainder, Some(first.to_string()))
            }
            _ => (rest, None),
        };

        // A ':' after the last '/' separates the tag.
        let (name, tag) = match rest.rfind(':') {
            Some(idx) if !rest[idx..].contains('/') => {
                (rest[..idx].to_string(), Some(rest[idx + 1..].to_string()))
            }
            _ => (rest.to_string(), None),
        };

        Self {
            registry,
            name,
            tag,
            digest,
        }
    }

    /// The same reference re-pointed at another tag, dropping any digest.
    pub fn with_tag(&self, tag: &str) -> Self {
        Self {
            registry: self.registry.clone(),
            name: self.name.clone(),
            tag: Some(tag.to_string()),
            digest: None,
        }
    }

    /// Whether this reference is pinned to an opaque digest with no tag to
    /// roll. Such containers are excluded from tag-driven updates.
    pub fn is_digest_pinned(&self) -> bool {
        self.digest.is_some() && self.tag.is_none()
    }

    /// Repository path including the registry, without tag or digest.
    pub fn repository(&self) -> String {
        match &self.registry {
            Some(reg) => format!("{}/{}", reg, self.name),
            None => self.name.clone(),
        }
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.repository())?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

// ============================================================================
// Containers
// ============================================================================

/// One row of `GET /containers/json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSummary {
    pub id: String,
    #[serde(default)]
    pub names: Vec<String>,
    pub image: String,
    #[serde(rename = "ImageID", default)]
    pub image_id: Option<String>,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub ports: Vec<PortSummary>,
}

impl ContainerSummary {
    /// First reported name without the daemon's leading slash.
    pub fn name(&self) -> String {
        self.names
            .first()
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created.and_then(|s| DateTime::from_timestamp(s, 0))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortSummary {
    #[serde(rename = "IP", default)]
    pub ip: Option<String>,
    pub private_port: u16,
    #[serde(default)]
    pub public_port: Option<u16>,
    #[serde(rename = "Type", default)]
    pub protocol: Option<String>,
}

/// `GET /containers/{id}/json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub created: Option<String>,
    /// Image ID digest.
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub state: Option<ContainerStateDetails>,
    #[serde(default)]
    pub config: Option<ContainerConfigDetails>,
    #[serde(default)]
    pub host_config: Option<HostConfig>,
}

impl ContainerDetails {
    pub fn is_running(&self) -> bool {
        self.state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false)
    }

    /// Health status when the image defines a healthcheck.
    pub fn health_status(&self) -> Option<&str> {
        self.state
            .as_ref()
            .and_then(|s| s.health.as_ref())
            .and_then(|h| h.status.as_deref())
    }

    /// Rebuild a create-spec from the inspected container, so an update can
    /// recreate it with only the image reference changed.
    pub fn to_spec(&self) -> ContainerSpec {
        let config = self.config.clone().unwrap_or_default();
        ContainerSpec {
            image: config.image.unwrap_or_default(),
            cmd: config.cmd,
            env: config.env,
            labels: config.labels,
            exposed_ports: config.exposed_ports,
            host_config: self.host_config.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerStateDetails {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub running: Option<bool>,
    #[serde(default)]
    pub health: Option<HealthDetails>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HealthDetails {
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfigDetails {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
    #[serde(default)]
    pub env: Option<Vec<String>>,
    #[serde(default)]
    pub labels: Option<HashMap<String, String>>,
    #[serde(default)]
    pub exposed_ports: Option<HashMap<String, serde_json::Value>>,
}

/// Body of `POST /containers/create`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSpec {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposed_ports: Option<HashMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_config: Option<HostConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binds: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_bindings: Option<HashMap<String, Vec<PortBinding>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_shares: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<RestartPolicy>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortBinding {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RestartPolicy {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_retry_count: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateContainerResponse {
    pub id: String,
    #[serde(default)]
    pub warnings: Option<Vec<String>>,
}

/// Body of `POST /containers/{id}/update`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateContainerRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_shares: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<RestartPolicy>,
}

// ============================================================================
// Images
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageSummary {
    pub id: String,
    #[serde(default)]
    pub repo_tags: Option<Vec<String>>,
    #[serde(default)]
    pub repo_digests: Option<Vec<String>>,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub size: Option<i64>,
    #[serde(default)]
    pub labels: Option<HashMap<String, String>>,
}

/// `GET /images/{name}/json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageDetails {
    pub id: String,
    #[serde(default)]
    pub repo_tags: Option<Vec<String>>,
    #[serde(default)]
    pub repo_digests: Option<Vec<String>>,
    #[serde(default)]
    pub created: Option<String>,
}

/// One progress line of `POST /images/create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullProgress {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub progress: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

// ============================================================================
// Networks
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkResource {
    pub name: String,
    pub id: String,
    #[serde(default)]
    pub driver: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateNetworkRequest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_duplicate: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateNetworkResponse {
    pub id: String,
    #[serde(default)]
    pub warning: Option<String>,
}

// ============================================================================
// Info
// ============================================================================

/// Raw `GET /info` payload; only the fields the control plane reads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SystemInfo {
    #[serde(rename = "ID", default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub containers: Option<i64>,
    #[serde(default)]
    pub containers_running: Option<i64>,
    #[serde(default)]
    pub images: Option<i64>,
    #[serde(rename = "NCPU", default)]
    pub ncpu: Option<i64>,
    #[serde(default)]
    pub mem_total: Option<i64>,
    #[serde(default)]
    pub server_version: Option<String>,
}

/// Endpoint info after merging daemon data with node-registry health.
/// `PartialEq` drives the cache's change detection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointInfo {
    pub endpoint: String,
    pub containers: i64,
    pub containers_running: i64,
    pub images: i64,
    pub ncpu: i64,
    pub mem_total: i64,
    pub server_version: Option<String>,
    pub nodes: Vec<NodeInfoRow>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeInfoRow {
    pub name: String,
    pub address: Option<String>,
    pub healthy: Option<bool>,
    pub sys_cpu_jiffies: Option<u64>,
    pub memory_total: Option<u64>,
    pub health_time: Option<DateTime<Utc>>,
}

// ============================================================================
// Events, logs, stats
// ============================================================================

/// One frame of `GET /events`. v1.24 daemons emit both the structured
/// `Type`/`Action`/`Actor` form and the legacy `status`/`id`/`from` fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerEvent {
    #[serde(rename = "Type", default)]
    pub typ: Option<String>,
    #[serde(rename = "Action", default)]
    pub action: Option<String>,
    #[serde(rename = "Actor", default)]
    pub actor: Option<EventActor>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub time: Option<i64>,
}

impl DockerEvent {
    pub fn action_name(&self) -> Option<&str> {
        self.action.as_deref().or(self.status.as_deref())
    }

    pub fn subject_id(&self) -> Option<&str> {
        self.actor
            .as_ref()
            .and_then(|a| a.id.as_deref())
            .or(self.id.as_deref())
    }

    pub fn is_container_event(&self) -> bool {
        match self.typ.as_deref() {
            Some(t) => t == "container",
            // Legacy frames have no Type; the ones with a status are
            // container events.
            None => self.status.is_some(),
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.actor
            .as_ref()
            .and_then(|a| a.attributes.get(name))
            .map(|s| s.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventActor {
    #[serde(rename = "ID", default)]
    pub id: Option<String>,
    #[serde(rename = "Attributes", default)]
    pub attributes: HashMap<String, String>,
}

/// Which daemon stream a log frame came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdStream {
    Stdout,
    Stderr,
}

/// A decoded log frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEvent {
    pub stream: StdStream,
    pub data: bytes::Bytes,
}

/// One frame of `GET /containers/{id}/stats`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsFrame {
    #[serde(default)]
    pub read: Option<String>,
    #[serde(default)]
    pub cpu_stats: CpuUsageStats,
    #[serde(default)]
    pub precpu_stats: CpuUsageStats,
    #[serde(default)]
    pub memory_stats: MemoryUsageStats,
    #[serde(default)]
    pub networks: Option<HashMap<String, NetworkCounters>>,
}

impl StatsFrame {
    /// CPU usage percentage across online CPUs, delta against the previous
    /// sample the daemon embeds in the frame.
    pub fn cpu_percent(&self) -> f64 {
        let cpu_delta = self
            .cpu_stats
            .cpu_usage
            .total_usage
            .saturating_sub(self.precpu_stats.cpu_usage.total_usage);
        let system_delta = self
            .cpu_stats
            .system_cpu_usage
            .unwrap_or(0)
            .saturating_sub(self.precpu_stats.system_cpu_usage.unwrap_or(0));
        let online_cpus = self.cpu_stats.online_cpus.unwrap_or(1);

        if system_delta > 0 && online_cpus > 0 {
            (cpu_delta as f64 / system_delta as f64) * online_cpus as f64 * 100.0
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuUsageStats {
    #[serde(default)]
    pub cpu_usage: CpuUsage,
    #[serde(default)]
    pub system_cpu_usage: Option<u64>,
    #[serde(default)]
    pub online_cpus: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuUsage {
    #[serde(default)]
    pub total_usage: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryUsageStats {
    #[serde(default)]
    pub usage: Option<u64>,
    #[serde(default)]
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkCounters {
    #[serde(default)]
    pub rx_bytes: u64,
    #[serde(default)]
    pub tx_bytes: u64,
}

// ============================================================================
// Call options
// ============================================================================

/// Options for `GET /containers/{id}/logs`.
#[derive(Debug, Clone)]
pub struct LogOptions {
    pub follow: bool,
    pub stdout: bool,
    pub stderr: bool,
    pub timestamps: bool,
    pub tail: Option<String>,
    pub since: Option<i64>,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            follow: false,
            stdout: true,
            stderr: true,
            timestamps: false,
            tail: None,
            since: None,
        }
    }
}

/// Options for `GET /containers/{id}/stats`.
#[derive(Debug, Clone, Default)]
pub struct StatsOptions {
    pub stream: bool,
}
