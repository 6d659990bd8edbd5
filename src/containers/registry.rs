//! Container registry

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::docker::{ContainerSummary, DockerEvent, ImageRef, PortSummary};
use crate::events::{BusEvent, ContainerEvent, EventBus, TOPIC_CONTAINER_EVENTS};
use crate::kv::{self, KvStore};

/// Minimal identity needed to register a container.
#[derive(Debug, Clone)]
pub struct ContainerBase {
    pub id: String,
    pub name: String,
    pub image: String,
    pub image_id: Option<String>,
}

impl ContainerBase {
    pub fn from_summary(summary: &ContainerSummary) -> Self {
        Self {
            id: summary.id.clone(),
            name: summary.name(),
            image: summary.image.clone(),
            image_id: summary.image_id.clone(),
        }
    }
}

/// Last-known attributes of one container, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRegistration {
    pub id: String,
    pub name: String,
    /// Node the container lives on.
    pub node: String,
    /// Image reference as the daemon reported it.
    pub image: String,
    /// Image ID digest, set whenever the daemon reports one.
    #[serde(default)]
    pub image_id: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub ports: Vec<PortSummary>,
    /// Last-observed status string.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
}

impl ContainerRegistration {
    pub fn image_ref(&self) -> ImageRef {
        ImageRef::parse(&self.image)
    }

    /// Cluster-wide unique name: `node-name/container-name`.
    pub fn fleet_name(&self) -> String {
        format!("{}/{}", self.node, self.name)
    }
}

pub struct ContainerRegistry {
    entries: DashMap<String, ContainerRegistration>,
    kv: Arc<dyn KvStore>,
    prefix: String,
    events: Arc<EventBus>,
}

impl ContainerRegistry {
    pub fn new(kv: Arc<dyn KvStore>, prefix: impl Into<String>, events: Arc<EventBus>) -> Self {
        Self {
            entries: DashMap::new(),
            kv,
            prefix: prefix.into(),
            events,
        }
    }

    fn key(&self, id: &str) -> String {
        format!("{}/containers/{}", self.prefix, id)
    }

    async fn flush(&self, registration: &ContainerRegistration) {
        let key = self.key(&registration.id);
        if let Err(e) = kv::put_json(self.kv.as_ref(), &key, registration).await {
            // Keep the in-memory mutation; reconciliation re-flushes.
            warn!("Failed to persist container {}: {}", registration.id, e);
        }
    }

    /// Rebuild the index from the KV store.
    pub async fn load(&self) -> Result<usize, crate::kv::KvError> {
        let keys = self.kv.list(&format!("{}/containers/", self.prefix)).await?;
        let mut loaded = 0;
        for key in keys {
            match kv::get_json::<ContainerRegistration>(self.kv.as_ref(), &key).await {
                Ok(Some(registration)) => {
                    self.entries.insert(registration.id.clone(), registration);
                    loaded += 1;
                }
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable container record {}: {}", key, e),
            }
        }
        info!("Loaded {} containers from KV", loaded);
        Ok(loaded)
    }

    pub fn list(&self) -> Vec<ContainerRegistration> {
        let mut all: Vec<ContainerRegistration> =
            self.entries.iter().map(|r| r.clone()).collect();
        all.sort_by(|a, b| a.fleet_name().cmp(&b.fleet_name()));
        all
    }

    pub fn get(&self, id: &str) -> Option<ContainerRegistration> {
        self.entries.get(id).map(|r| r.clone())
    }

    /// Find by exact ID first, then by ID prefix, then by name (bare or
    /// `node/name` form).
    pub fn find(&self, name_or_id: &str) -> Option<ContainerRegistration> {
        if let Some(exact) = self.get(name_or_id) {
            return Some(exact);
        }
        self.entries
            .iter()
            .find(|r| r.id.starts_with(name_or_id))
            .map(|r| r.clone())
            .or_else(|| {
                self.entries
                    .iter()
                    .find(|r| r.name == name_or_id || r.fleet_name() == name_or_id)
                    .map(|r| r.clone())
            })
    }

    pub fn list_by_node(&self, node: &str) -> Vec<ContainerRegistration> {
        let mut on_node: Vec<ContainerRegistration> = self
            .entries
            .iter()
            .filter(|r| r.node == node)
            .map(|r| r.clone())
            .collect();
        on_node.sort_by(|a, b| a.name.cmp(&b.name));
        on_node
    }

    /// Register a container if it is unknown; returns the registration and
    /// whether it was created. Creation flushes to KV immediately.
    pub async fn get_or_create(
        &self,
        base: &ContainerBase,
        node: &str,
    ) -> (ContainerRegistration, bool) {
        let mut created = false;
        let registration = self
            .entries
            .entry(base.id.clone())
            .or_insert_with(|| {
                created = true;
                ContainerRegistration {
                    id: base.id.clone(),
                    name: base.name.clone(),
                    node: node.to_string(),
                    image: base.image.clone(),
                    image_id: base.image_id.clone(),
                    labels: HashMap::new(),
                    ports: Vec::new(),
                    status: None,
                    created: Some(Utc::now()),
                }
            })
            .clone();
        if created {
            info!(
                "Registered container {} ({}) on {}",
                registration.name, registration.id, node
            );
            self.flush(&registration).await;
        }
        (registration, created)
    }

    /// Remove a registration: KV subtree first, then the map. KV failures
    /// are tolerated with a warning.
    pub async fn remove(&self, id: &str) -> Option<ContainerRegistration> {
        if let Err(e) = self.kv.delete_prefix(&self.key(id)).await {
            warn!("Failed to delete container {} from KV: {}", id, e);
        }
        self.entries.remove(id).map(|(_, registration)| {
            debug!("Removed container {} ({})", registration.name, id);
            registration
        })
    }

    /// Drop every registration on a node, e.g. when the node is removed.
    pub async fn remove_node(&self, node: &str) -> usize {
        let ids: Vec<String> = self
            .entries
            .iter()
            .filter(|r| r.node == node)
            .map(|r| r.id.clone())
            .collect();
        let mut removed = 0;
        for id in ids {
            if self.remove(&id).await.is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Apply one decoded daemon event from the given node and mirror it on
    /// the bus as a normalized container event.
    pub async fn apply_event(&self, node: &str, event: &DockerEvent) {
        if !event.is_container_event() {
            return;
        }
        let (Some(action), Some(id)) = (event.action_name(), event.subject_id()) else {
            return;
        };
        let action = action.to_string();
        let id = id.to_string();

        match action.as_str() {
            "create" => {
                let base = ContainerBase {
                    id: id.clone(),
                    name: event.attribute("name").unwrap_or_default().to_string(),
                    image: event
                        .attribute("image")
                        .or(event.from.as_deref())
                        .unwrap_or_default()
                        .to_string(),
                    image_id: None,
                };
                self.get_or_create(&base, node).await;
            }
            "destroy" | "remove" => {
                self.remove(&id).await;
            }
            "start" | "stop" | "die" | "pause" | "unpause" | "rename" => {
                let updated = self.entries.get_mut(&id).map(|mut entry| {
                    entry.status = Some(action.clone());
                    if action == "rename" {
                        if let Some(name) = event.attribute("name") {
                            entry.name = name.trim_start_matches('/').to_string();
                        }
                    }
                    entry.clone()
                });
                if let Some(registration) = updated {
                    self.flush(&registration).await;
                }
            }
            _ => {}
        }

        self.events.publish(
            TOPIC_CONTAINER_EVENTS,
            BusEvent::Container(ContainerEvent {
                id: Some(id),
                node: node.to_string(),
                action,
                image: event
                    .attribute("image")
                    .or(event.from.as_deref())
                    .map(|s| s.to_string()),
                time: Utc::now(),
            }),
        );
    }

    /// Full repair against a daemon listing: upsert everything reported,
    /// drop registrations for this node the daemon no longer knows.
    pub async fn reconcile(&self, node: &str, listing: &[ContainerSummary]) -> (usize, usize) {
        let mut updated = 0;
        for summary in listing {
            let base = ContainerBase::from_summary(summary);
            self.get_or_create(&base, node).await;
            let fresh = self.entries.get_mut(&summary.id).map(|mut entry| {
                entry.name = summary.name();
                entry.image = summary.image.clone();
                if summary.image_id.is_some() {
                    entry.image_id = summary.image_id.clone();
                }
                entry.labels = summary.labels.clone();
                entry.ports = summary.ports.clone();
                entry.status = summary.state.clone().or(summary.status.clone());
                if entry.created.is_none() {
                    entry.created = summary.created_at();
                }
                entry.clone()
            });
            if let Some(registration) = fresh {
                self.flush(&registration).await;
                updated += 1;
            }
        }

        let reported: std::collections::HashSet<&str> =
            listing.iter().map(|c| c.id.as_str()).collect();
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|r| r.node == node && !reported.contains(r.id.as_str()))
            .map(|r| r.id.clone())
            .collect();
        let removed = stale.len();
        for id in stale {
            self.remove(&id).await;
        }
        (updated, removed)
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }
}
