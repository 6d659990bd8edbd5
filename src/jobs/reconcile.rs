//! Image-tag reconciliation
//!
//! A periodic job that, for every watched image, asks its registry for the
//! current tags, picks the greatest under the version comparator, resolves
//! that tag's digest, and emits a rolling-update job when containers in
//! the watched cluster run something older. A registry that does not
//! answer skips its image without failing the cycle.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::config::WatchedImage;
use crate::docker::RegistryClient;

use super::context::JobContext;
use super::definition::{JobError, JobHandler, JobOutcome, JobParameters, JobScope, JobSchema, JobType};
use super::update::{UpdateFilter, UpdateStrategy};

pub const JOB_WATCH_IMAGE_TAGS: &str = "job.watchImageTags";

/// What the reconciler last resolved for a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTag {
    pub tag: String,
    pub image_id: Option<String>,
}

pub struct TagReconciler {
    /// `registry-url/repository` → latest resolved tag.
    cache: DashMap<String, ResolvedTag>,
}

impl TagReconciler {
    pub fn new() -> Self {
        Self {
            cache: DashMap::new(),
        }
    }

    pub fn job_type(self: Arc<Self>) -> JobType {
        JobType {
            name: JOB_WATCH_IMAGE_TAGS.to_string(),
            schema: JobSchema::default(),
            repeatable: false,
            scope: JobScope::Unrestricted,
            handler: self,
        }
    }

    pub fn resolved(&self, registry: &str, repository: &str) -> Option<ResolvedTag> {
        self.cache
            .get(&cache_key(registry, repository))
            .map(|r| r.clone())
    }

    fn registry_for<'a>(
        &self,
        registries: &'a [RegistryClient],
        watched: &WatchedImage,
    ) -> Option<&'a RegistryClient> {
        match &watched.registry {
            Some(url) => registries.iter().find(|r| r.base_url() == url),
            None => registries.first(),
        }
    }

    async fn reconcile_one(&self, ctx: &JobContext, watched: &WatchedImage) -> Option<()> {
        let registries = &ctx.services.registries;
        let Some(client) = self.registry_for(registries, watched) else {
            ctx.fire(format!(
                "{}: no registry configured, skipping",
                watched.repository
            ));
            return None;
        };

        let tags = match client.list_tags(&watched.repository).await {
            Ok(Some(tags)) => tags,
            Ok(None) => {
                ctx.fire(format!(
                    "{}: unknown to {}, skipping",
                    watched.repository,
                    client.base_url()
                ));
                return None;
            }
            Err(e) => {
                ctx.fire(format!("{}: registry error, skipping: {}", watched.repository, e));
                return None;
            }
        };

        let best = ctx
            .services
            .comparator
            .max(tags.iter().map(|t| t.as_str()))?
            .to_string();

        let image_id = match client.manifest_digest(&watched.repository, &best).await {
            Ok(digest) => digest,
            Err(e) => {
                ctx.fire(format!(
                    "{}: manifest for {} unavailable, skipping: {}",
                    watched.repository, best, e
                ));
                return None;
            }
        };

        let resolved = ResolvedTag {
            tag: best.clone(),
            image_id: image_id.clone(),
        };
        let key = cache_key(client.base_url(), &watched.repository);
        let changed = self
            .cache
            .insert(key, resolved)
            .map(|old| old.tag != best)
            .unwrap_or(true);
        if changed {
            ctx.fire(format!("{}: latest tag is now {}", watched.repository, best));
        }

        // Anything older running in the watched cluster?
        let filter = match UpdateFilter::new(&watched.pattern, &best, image_id) {
            Ok(filter) => filter,
            Err(e) => {
                ctx.fire(format!("{}: {}", watched.repository, e));
                return None;
            }
        };
        let outdated = ctx
            .services
            .cluster_containers(&watched.cluster)
            .iter()
            .any(|r| filter.accepts(r));
        if !outdated {
            debug!("{}: cluster {} is current", watched.repository, watched.cluster);
            return None;
        }

        let strategy = UpdateStrategy::from_job_type(&watched.strategy)
            .unwrap_or(UpdateStrategy::StopThenStartEach);
        let manager = ctx.services.manager()?;
        let parameters = JobParameters::new()
            .with("cluster", watched.cluster.clone())
            .with("image", watched.pattern.clone())
            .with("target_version", best.clone())
            .with("health_check_enabled", watched.health_check_enabled)
            .with("rollback_enabled", watched.rollback_enabled)
            .with("time_before_kill", watched.time_before_kill_s);
        match manager.submit(strategy.job_type_name(), parameters).await {
            Ok(instance) => {
                ctx.fire(format!(
                    "{}: emitted {} ({}) targeting {}",
                    watched.repository,
                    strategy.job_type_name(),
                    instance.id,
                    best
                ));
            }
            Err(e) => {
                // Usually a prior update still running in the cluster.
                ctx.fire(format!("{}: update not emitted: {}", watched.repository, e));
            }
        }
        Some(())
    }
}

impl Default for TagReconciler {
    fn default() -> Self {
        Self::new()
    }
}

fn cache_key(registry: &str, repository: &str) -> String {
    format!("{}/{}", registry, repository)
}

#[async_trait]
impl JobHandler for TagReconciler {
    async fn execute(&self, ctx: &JobContext) -> JobOutcome {
        let images = ctx.services.update_config.images.clone();
        if images.is_empty() {
            ctx.fire("no images configured to watch");
            return Ok(());
        }
        for watched in &images {
            if ctx.is_cancelled() {
                return Err(JobError::Cancelled);
            }
            self.reconcile_one(ctx, watched).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DockerConfiguration, UpdateConfiguration};
    use crate::config::RegistryConfiguration;
    use crate::containers::{ContainerBase, ContainerRegistry};
    use crate::discovery::{ClusterConfig, DiscoveryStorage};
    use crate::events::EventBus;
    use crate::jobs::context::JobServices;
    use crate::jobs::instance::JobStatus;
    use crate::jobs::manager::JobManager;
    use crate::kv::MemoryKv;
    use crate::node::NodeRegistry;
    use crate::version::VersionComparator;
    use axum::routing::get;
    use axum::Router;

    async fn spawn_registry(tags: &'static str) -> String {
        let router = Router::new()
            .route(
                "/v2/library/testimage/tags/list",
                get(move || async move { tags }),
            )
            .route(
                "/v2/library/testimage/manifests/:tag",
                get(|| async {
                    (
                        [(
                            "Docker-Content-Digest",
                            "sha256:feedfacefeedfacefeedfacefeedfacefeedfacefeedfacefeedfacefeedface",
                        )],
                        "",
                    )
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    async fn services_with(
        registry_url: &str,
        update_config: UpdateConfiguration,
        comparator: VersionComparator,
    ) -> (JobServices, Arc<MemoryKv>) {
        let kv = Arc::new(MemoryKv::new());
        let events = Arc::new(EventBus::new());
        let nodes = Arc::new(NodeRegistry::new(kv.clone(), "f", events.clone()));
        let discovery = Arc::new(DiscoveryStorage::new(
            kv.clone(),
            "f",
            events.clone(),
            nodes.clone(),
            DockerConfiguration::default(),
        ));
        let containers = Arc::new(ContainerRegistry::new(kv.clone(), "f", events.clone()));

        discovery
            .get_or_create_cluster(ClusterConfig::new("testcluster"))
            .await;
        nodes.register("n1", "10.0.0.1:1").await;
        discovery
            .set_node_cluster("n1", Some("testcluster".into()))
            .await
            .unwrap();
        containers
            .get_or_create(
                &ContainerBase {
                    id: "c1".into(),
                    name: "web".into(),
                    image: "testimage:1.0".into(),
                    image_id: Some("sha256:old".into()),
                },
                "n1",
            )
            .await;

        let registries = vec![RegistryClient::new(&RegistryConfiguration {
            url: registry_url.to_string(),
            username: None,
            password: None,
        })
        .unwrap()];

        let services = JobServices::new(
            discovery,
            nodes,
            containers,
            events,
            Arc::new(comparator),
            Arc::new(registries),
            Arc::new(update_config),
        );
        (services, kv)
    }

    fn watched() -> UpdateConfiguration {
        UpdateConfiguration {
            images: vec![WatchedImage {
                repository: "library/testimage".into(),
                registry: None,
                cluster: "testcluster".into(),
                pattern: "*".into(),
                strategy: JOB_WATCH_IMAGE_TAGS.into(), // unknown: falls back
                health_check_enabled: false,
                rollback_enabled: false,
                time_before_kill_s: 1,
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_alias_tag_selected_and_update_emitted() {
        let url =
            spawn_registry(r#"{"name":"library/testimage","tags":["1.0","1.1","2.0_rc","latest"]}"#)
                .await;
        let comparator =
            VersionComparator::new(vec!["latest".into()], vec!["rc".into()], true);
        let (services, kv) = services_with(&url, watched(), comparator).await;
        let manager = JobManager::new(services.clone(), kv, "f");
        for job_type in crate::jobs::update::update_job_types() {
            manager.register(job_type);
        }
        let reconciler = Arc::new(TagReconciler::new());
        manager.register(reconciler.clone().job_type());

        let instance = manager
            .submit(JOB_WATCH_IMAGE_TAGS, JobParameters::new())
            .await
            .unwrap();
        assert_eq!(instance.at_end().await, JobStatus::Completed);

        let resolved = reconciler.resolved(&url, "library/testimage").unwrap();
        assert_eq!(resolved.tag, "latest");

        // An update job for the cluster was emitted.
        let emitted = manager
            .list()
            .into_iter()
            .find(|r| r.type_name.starts_with("job.updateContainers."));
        let emitted = emitted.expect("update job emitted");
        assert_eq!(
            emitted.parameters.get_str("target_version").unwrap().as_deref(),
            Some("latest")
        );
    }

    #[tokio::test]
    async fn test_alias_disabled_selects_ordinary_version() {
        let url =
            spawn_registry(r#"{"name":"library/testimage","tags":["1.0","1.1","2.0_rc","latest"]}"#)
                .await;
        let comparator = VersionComparator::new(vec![], vec!["rc".into()], true);
        let (services, kv) = services_with(&url, watched(), comparator).await;
        let manager = JobManager::new(services, kv, "f");
        for job_type in crate::jobs::update::update_job_types() {
            manager.register(job_type);
        }
        let reconciler = Arc::new(TagReconciler::new());
        manager.register(reconciler.clone().job_type());

        let instance = manager
            .submit(JOB_WATCH_IMAGE_TAGS, JobParameters::new())
            .await
            .unwrap();
        assert_eq!(instance.at_end().await, JobStatus::Completed);

        assert_eq!(
            reconciler.resolved(&url, "library/testimage").unwrap().tag,
            "2.0_rc"
        );
    }

    #[tokio::test]
    async fn test_missing_registry_response_skips_cycle() {
        // Registry with no routes: tags/list answers 404.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, Router::new()).await.unwrap();
        });
        let url = format!("http://{}", addr);

        let (services, kv) = services_with(&url, watched(), VersionComparator::default()).await;
        let manager = JobManager::new(services, kv, "f");
        let reconciler = Arc::new(TagReconciler::new());
        manager.register(reconciler.clone().job_type());

        let instance = manager
            .submit(JOB_WATCH_IMAGE_TAGS, JobParameters::new())
            .await
            .unwrap();
        // The cycle completes despite the missing repository.
        assert_eq!(instance.at_end().await, JobStatus::Completed);
        assert!(reconciler.resolved(&url, "library/testimage").is_none());
        assert!(instance.tail().iter().any(|l| l.contains("skipping")));
    }
}
