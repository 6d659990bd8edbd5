//! Application assembly
//!
//! One root value owns every subsystem and is passed explicitly wherever
//! services are needed; nothing is ambient. Startup rebuilds state from
//! the KV store, reconciles it against the live endpoints, starts the
//! per-node event pumps and the periodic jobs, then serves the REST API
//! until shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Configuration;
use crate::containers::ContainerRegistry;
use crate::discovery::DiscoveryStorage;
use crate::docker::RegistryClient;
use crate::events::EventBus;
use crate::jobs::{update, JobManager, JobParameters, JobServices, TagReconciler, JOB_WATCH_IMAGE_TAGS};
use crate::kv::{self, KvStore};
use crate::node::NodeRegistry;
use crate::routes;
use crate::source::SourceService;
use crate::version::VersionComparator;

pub struct Application {
    pub config: Arc<Configuration>,
    pub kv: Arc<dyn KvStore>,
    pub events: Arc<EventBus>,
    pub nodes: Arc<NodeRegistry>,
    pub discovery: Arc<DiscoveryStorage>,
    pub containers: Arc<ContainerRegistry>,
    pub jobs: Arc<JobManager>,
    pub source: SourceService,
    pub comparator: Arc<VersionComparator>,
    /// Event pump cancellation tokens, one per node.
    pumps: DashMap<String, CancellationToken>,
    shutdown: CancellationToken,
}

impl Application {
    pub async fn build(config: Configuration) -> anyhow::Result<Arc<Self>> {
        let config = Arc::new(config);
        let kv = kv::connect(&config.kv)
            .await
            .context("Failed to connect KV store")?;
        let prefix = config.kv.prefix.clone();

        let events = Arc::new(EventBus::new());
        let nodes = Arc::new(NodeRegistry::new(kv.clone(), prefix.clone(), events.clone()));
        let discovery = Arc::new(DiscoveryStorage::new(
            kv.clone(),
            prefix.clone(),
            events.clone(),
            nodes.clone(),
            config.docker.clone(),
        ));
        let containers = Arc::new(ContainerRegistry::new(
            kv.clone(),
            prefix.clone(),
            events.clone(),
        ));

        let comparator = Arc::new(VersionComparator::new(
            config.update.latest_aliases.clone(),
            config.update.suffixes.clone(),
            config.update.empty_suffix_last,
        ));
        let mut registries = Vec::with_capacity(config.registries.len());
        for registry in &config.registries {
            registries.push(
                RegistryClient::new(registry)
                    .with_context(|| format!("Bad registry configuration: {}", registry.url))?,
            );
        }

        let services = JobServices::new(
            discovery.clone(),
            nodes.clone(),
            containers.clone(),
            events.clone(),
            comparator.clone(),
            Arc::new(registries),
            Arc::new(config.update.clone()),
        );
        let jobs = JobManager::new(services, kv.clone(), prefix);
        for job_type in update::update_job_types() {
            jobs.register(job_type);
        }
        jobs.register(Arc::new(TagReconciler::new()).job_type());

        let source = SourceService::new(discovery.clone(), nodes.clone(), containers.clone());

        Ok(Arc::new(Self {
            config,
            kv,
            events,
            nodes,
            discovery,
            containers,
            jobs,
            source,
            comparator,
            pumps: DashMap::new(),
            shutdown: CancellationToken::new(),
        }))
    }

    /// Rebuild state from KV, reconcile against live endpoints, start the
    /// background machinery.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        self.nodes.load().await?;
        self.discovery.load().await?;
        self.containers.load().await?;

        self.sync_endpoints().await;
        self.spawn_sync_task();

        if !self.config.update.images.is_empty() {
            self.jobs.schedule_periodic(
                JOB_WATCH_IMAGE_TAGS,
                JobParameters::new(),
                Duration::from_secs(self.config.update.interval_s),
                self.shutdown.child_token(),
            );
        }
        Ok(())
    }

    /// Serve the REST API until ctrl-c or an explicit shutdown.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        self.start().await?;

        let bind = format!("{}:{}", self.config.api.host, self.config.api.port);
        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .with_context(|| format!("Failed to bind {}", bind))?;
        info!("REST API listening on {}", bind);

        let shutdown = self.shutdown.clone();
        let router = routes::router(self.clone());
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received ctrl-c, shutting down"),
                    _ = shutdown.cancelled() => {}
                }
            })
            .await?;

        self.shutdown();
        Ok(())
    }

    /// Stop pumps, periodic jobs and the server.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// One reconciliation sweep: make sure every node has an event pump,
    /// repair the container index against live listings, refresh endpoint
    /// info. Nodes are swept in parallel with bounded fan-out.
    pub async fn sync_endpoints(self: &Arc<Self>) {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(num_cpus::get()));
        let mut handles = Vec::new();
        for node in self.nodes.list() {
            self.ensure_pump(&node.name);

            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                return;
            };
            let app = self.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                app.sync_node(&node.name).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn sync_node(&self, node: &str) {
        let service = match self.discovery.get_node_service(node) {
            Ok(service) => service,
            Err(e) => {
                warn!("No endpoint client for node {}: {}", node, e);
                return;
            }
        };
        match service.list_containers(true).await {
            Ok(listing) => {
                let (updated, removed) = self.containers.reconcile(node, &listing).await;
                debug!("Reconciled {}: {} updated, {} removed", node, updated, removed);
            }
            Err(e) => debug!("Skipping reconciliation of {}: {}", node, e),
        }
        if let Err(e) = service.get_info().await {
            debug!("Info refresh of {} failed: {}", node, e);
        }
    }

    fn spawn_sync_task(self: &Arc<Self>) {
        let app = self.clone();
        let interval = Duration::from_secs(self.config.docker.reconcile_interval_s);
        let shutdown = self.shutdown.child_token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => app.sync_endpoints().await,
                }
            }
        });
    }

    /// Keep one daemon event subscription per node, feeding the container
    /// registry. The pump retires itself when its node goes away.
    fn ensure_pump(self: &Arc<Self>, node: &str) {
        if self.pumps.contains_key(node) {
            return;
        }
        let token = self.shutdown.child_token();
        self.pumps.insert(node.to_string(), token.clone());

        let app = self.clone();
        let node = node.to_string();
        let retry = Duration::from_secs(self.config.docker.event_retry_s);
        tokio::spawn(async move {
            debug!("Event pump for {} starting", node);
            loop {
                if token.is_cancelled() || app.nodes.get(&node).is_none() {
                    break;
                }
                let service = match app.discovery.get_node_service(&node) {
                    Ok(service) => service,
                    Err(_) => break,
                };

                let (tx, mut rx) = mpsc::channel(256);
                let consumer = {
                    let app = app.clone();
                    let node = node.clone();
                    tokio::spawn(async move {
                        while let Some(event) = rx.recv().await {
                            app.containers.apply_event(&node, &event).await;
                        }
                    })
                };

                let end = service.subscribe_events(None, None, tx, &token).await;
                let _ = consumer.await;
                match end {
                    Ok(end) if end.is_cancelled() => break,
                    Ok(end) => debug!("Event stream of {} ended: {}", node, end.message()),
                    Err(e) => debug!("Event stream of {} unavailable: {}", node, e),
                }

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(retry) => {}
                }
            }
            app.pumps.remove(&node);
            debug!("Event pump for {} stopped", node);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    async fn serve_app() -> (Arc<Application>, String) {
        let app = Application::build(Configuration::default()).await.unwrap();
        let router = routes::router(app.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (app, base)
    }

    #[tokio::test]
    async fn test_cluster_crud_over_rest() {
        let (_app, base) = serve_app().await;
        let client = reqwest::Client::new();

        let created = client
            .put(format!("{}/clusters/edge", base))
            .json(&serde_json::json!({"title": "Edge fleet"}))
            .send()
            .await
            .unwrap();
        assert!(created.status().is_success());

        let list: serde_json::Value = client
            .get(format!("{}/clusters", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(list[0]["name"], "edge");
        assert_eq!(list[0]["title"], "Edge fleet");

        let deleted = client
            .delete(format!("{}/clusters/edge", base))
            .send()
            .await
            .unwrap();
        assert_eq!(deleted.status(), StatusCode::NO_CONTENT);

        let missing = client
            .delete(format!("{}/clusters/edge", base))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_locked_cluster_rejects_node_attach() {
        let (app, base) = serve_app().await;
        let client = reqwest::Client::new();

        client
            .put(format!("{}/clusters/locked", base))
            .json(&serde_json::json!({"features": ["FORBID_NODE_ADDITION"]}))
            .send()
            .await
            .unwrap();
        client
            .post(format!("{}/nodes/n1", base))
            .json(&serde_json::json!({"address": "10.0.0.1:2375"}))
            .send()
            .await
            .unwrap();

        let attach = client
            .post(format!("{}/clusters/locked/nodes/n1", base))
            .send()
            .await
            .unwrap();
        assert_eq!(attach.status(), StatusCode::CONFLICT);
        // The node's assignment is unchanged.
        assert_eq!(app.nodes.get("n1").unwrap().cluster, None);
    }

    #[tokio::test]
    async fn test_unknown_job_type_is_404() {
        let (_app, base) = serve_app().await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{}/jobs", base))
            .json(&serde_json::json!({"type": "job.doesNotExist", "parameters": {}}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["error"], true);
        assert!(body["message"].as_str().unwrap().contains("job.doesNotExist"));
    }

    #[tokio::test]
    async fn test_source_round_trip_over_rest() {
        let (_app, base) = serve_app().await;
        let client = reqwest::Client::new();

        client
            .put(format!("{}/clusters/edge", base))
            .json(&serde_json::json!({}))
            .send()
            .await
            .unwrap();

        let first: serde_json::Value = client
            .get(format!("{}/source", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        let posted = client
            .post(format!("{}/source", base))
            .json(&first)
            .send()
            .await
            .unwrap();
        assert!(posted.status().is_success());

        let second: serde_json::Value = client
            .get(format!("{}/source", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(first, second);
    }
}
