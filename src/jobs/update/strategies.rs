//! Rolling-update strategies
//!
//! Three orderings over the shared pipeline:
//!
//! - `stopThenStartEach`: swap containers one at a time in place.
//! - `startThenStopEach`: bring the replacement up next to the old one,
//!   verify, then retire the old. Costs capacity, preserves service.
//! - `stopThenStartAll`: stop everything, start everything, verify
//!   everything. Fastest, with a service gap.

use std::sync::Arc;

use async_trait::async_trait;

use crate::containers::ContainerRegistration;

use super::super::context::{ClusterScope, JobContext};
use super::super::definition::{
    JobError, JobHandler, JobOutcome, JobParameterDef, JobSchema, JobScope, JobType, ParameterKind,
};
use super::filter::UpdateFilter;
use super::pipeline::{ProcessedContainer, UpdatePipeline, UpdatePolicy, UpdateStage};

pub const JOB_UPDATE_STOP_THEN_START_EACH: &str = "job.updateContainers.stopThenStartEach";
pub const JOB_UPDATE_START_THEN_STOP_EACH: &str = "job.updateContainers.startThenStopEach";
pub const JOB_UPDATE_STOP_THEN_START_ALL: &str = "job.updateContainers.stopThenStartAll";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStrategy {
    StopThenStartEach,
    StartThenStopEach,
    StopThenStartAll,
}

impl UpdateStrategy {
    pub fn job_type_name(&self) -> &'static str {
        match self {
            UpdateStrategy::StopThenStartEach => JOB_UPDATE_STOP_THEN_START_EACH,
            UpdateStrategy::StartThenStopEach => JOB_UPDATE_START_THEN_STOP_EACH,
            UpdateStrategy::StopThenStartAll => JOB_UPDATE_STOP_THEN_START_ALL,
        }
    }

    pub fn from_job_type(name: &str) -> Option<Self> {
        match name {
            JOB_UPDATE_STOP_THEN_START_EACH => Some(UpdateStrategy::StopThenStartEach),
            JOB_UPDATE_START_THEN_STOP_EACH => Some(UpdateStrategy::StartThenStopEach),
            JOB_UPDATE_STOP_THEN_START_ALL => Some(UpdateStrategy::StopThenStartAll),
            _ => None,
        }
    }
}

fn update_schema() -> JobSchema {
    JobSchema::new(vec![
        JobParameterDef::required("cluster", ParameterKind::String),
        JobParameterDef::required("image", ParameterKind::String),
        JobParameterDef::required("target_version", ParameterKind::String),
        JobParameterDef::optional("health_check_enabled", ParameterKind::Bool),
        JobParameterDef::optional("rollback_enabled", ParameterKind::Bool),
        JobParameterDef::optional("time_before_kill", ParameterKind::Int),
        // Reserved; accepted but not interpreted yet.
        JobParameterDef::optional("percentage", ParameterKind::Float),
    ])
}

struct UpdateJobHandler {
    strategy: UpdateStrategy,
}

#[async_trait]
impl JobHandler for UpdateJobHandler {
    async fn execute(&self, ctx: &JobContext) -> JobOutcome {
        run_update(ctx, self.strategy).await
    }
}

/// The three update job types, for registration at startup.
pub fn update_job_types() -> Vec<JobType> {
    [
        UpdateStrategy::StopThenStartEach,
        UpdateStrategy::StartThenStopEach,
        UpdateStrategy::StopThenStartAll,
    ]
    .into_iter()
    .map(|strategy| JobType {
        name: strategy.job_type_name().to_string(),
        schema: update_schema(),
        repeatable: false,
        scope: JobScope::Cluster,
        handler: Arc::new(UpdateJobHandler { strategy }),
    })
    .collect()
}

/// Containers of the scope's cluster, refreshed from the endpoints when
/// the registry has nothing yet.
async fn gather(
    ctx: &JobContext,
    scope: &ClusterScope,
) -> Result<Vec<ContainerRegistration>, JobError> {
    let known = ctx.services.cluster_containers(&scope.cluster);
    if !known.is_empty() {
        return Ok(known);
    }
    let mut collected = Vec::new();
    for service in scope.service.all() {
        let listing = service.list_containers(true).await.map_err(JobError::from)?;
        let endpoint = service.address().id().to_string();
        ctx.services.containers.reconcile(&endpoint, &listing).await;
        collected.extend(ctx.services.containers.list_by_node(&endpoint));
    }
    Ok(collected)
}

pub async fn run_update(ctx: &JobContext, strategy: UpdateStrategy) -> JobOutcome {
    let scope = ctx.scope().ok_or_else(|| {
        JobError::Failed("cluster parameter missing or names no known cluster".into())
    })?;
    let pattern = ctx
        .params()
        .get_str("image")
        .map_err(JobError::Failed)?
        .ok_or_else(|| JobError::Failed("image parameter missing".into()))?;
    let target_version = ctx
        .params()
        .get_str("target_version")
        .map_err(JobError::Failed)?
        .ok_or_else(|| JobError::Failed("target_version parameter missing".into()))?;
    if ctx.params().contains("percentage") {
        ctx.fire("percentage parameter is reserved and currently ignored");
    }

    let policy = UpdatePolicy::from_params(ctx.params());
    let filter = UpdateFilter::new(&pattern, &target_version, None).map_err(JobError::Failed)?;

    let mut targets: Vec<ProcessedContainer> = gather(ctx, &scope)
        .await?
        .into_iter()
        .filter(|r| filter.accepts(r))
        .map(|r| ProcessedContainer::new(r, &target_version))
        .collect();
    ctx.fire(format!(
        "{} containers in {} selected for update to version {}",
        targets.len(),
        scope.cluster,
        target_version
    ));
    if targets.is_empty() {
        return Ok(());
    }

    let pipeline = UpdatePipeline::new(ctx, policy, scope.service.clone());
    let total = targets.len();
    let mut failures = 0usize;

    match strategy {
        UpdateStrategy::StopThenStartEach => {
            for pc in targets.iter_mut() {
                let result = stop_then_start_one(&pipeline, pc).await;
                record_outcome(ctx, pc, result, &mut failures)?;
            }
        }
        UpdateStrategy::StartThenStopEach => {
            for pc in targets.iter_mut() {
                let result = start_then_stop_one(&pipeline, pc).await;
                record_outcome(ctx, pc, result, &mut failures)?;
            }
        }
        UpdateStrategy::StopThenStartAll => {
            failures = stop_then_start_all(ctx, &pipeline, &mut targets).await?;
        }
    }

    if failures > 0 {
        Err(JobError::Failed(format!(
            "{} of {} containers failed to update",
            failures, total
        )))
    } else {
        Ok(())
    }
}

/// Swap one container in place: stop the old, bring the replacement up
/// under the original name, verify, retire the old.
async fn stop_then_start_one(
    pipeline: &UpdatePipeline<'_>,
    pc: &mut ProcessedContainer,
) -> JobOutcome {
    pipeline.load_image(pc).await?;
    pipeline.pre_check(pc).await?;
    pipeline.stop_old(pc, true).await?;

    let swapped = swap_in_place(pipeline, pc).await;
    match swapped {
        Ok(()) => {
            pipeline.delete_old(pc).await;
            pipeline.commit(pc).await;
            Ok(())
        }
        Err(e) => {
            // Past stop(old): reverse unless rollback is disabled.
            if pipeline.policy().rollback {
                pipeline.rollback(pc).await;
            }
            Err(e)
        }
    }
}

async fn swap_in_place(pipeline: &UpdatePipeline<'_>, pc: &mut ProcessedContainer) -> JobOutcome {
    let name = pc.registration.name.clone();
    pipeline.create_new(pc, &name).await?;
    pipeline.start_new(pc).await?;
    pipeline.post_check(pc).await
}

/// Bring the replacement up first, verify it, then retire the old
/// container and let the replacement take its name.
async fn start_then_stop_one(
    pipeline: &UpdatePipeline<'_>,
    pc: &mut ProcessedContainer,
) -> JobOutcome {
    pipeline.load_image(pc).await?;
    pipeline.pre_check(pc).await?;

    let brought_up = bring_up_beside(pipeline, pc).await;
    if let Err(e) = brought_up {
        // The old container was never touched; just drop the attempt.
        pipeline.discard_new(pc).await;
        return Err(e);
    }

    let stopped = pipeline.stop_old(pc, false).await;
    if let Err(e) = stopped {
        // The old container is still serving; drop the replacement.
        pipeline.discard_new(pc).await;
        return Err(e);
    }

    pipeline.delete_old(pc).await;
    let renamed = pipeline.rename_new_to_original(pc).await;
    if let Err(e) = renamed {
        // The old container is already gone; keep the replacement under
        // its temp name rather than losing the service, and track it.
        pipeline.commit(pc).await;
        return Err(e);
    }
    pipeline.commit(pc).await;
    Ok(())
}

async fn bring_up_beside(
    pipeline: &UpdatePipeline<'_>,
    pc: &mut ProcessedContainer,
) -> JobOutcome {
    let temp_name = format!("{}.new", pc.registration.name);
    pipeline.create_new(pc, &temp_name).await?;
    pipeline.start_new(pc).await?;
    pipeline.post_check(pc).await
}

/// Phase-ordered batch: stop all old, start all new, verify all new.
async fn stop_then_start_all(
    ctx: &JobContext,
    pipeline: &UpdatePipeline<'_>,
    targets: &mut [ProcessedContainer],
) -> Result<usize, JobError> {
    let mut failures = 0;

    // Images and pre-checks; failures drop out before anything is touched.
    for pc in targets.iter_mut() {
        let prepared = prepare(pipeline, pc).await;
        if let Err(e) = prepared {
            record_failure(ctx, pc, e, &mut failures)?;
        }
    }

    // Phase 1: stop everything that survived.
    ctx.fire("Stopping old containers");
    for pc in targets
        .iter_mut()
        .filter(|pc| pc.stage == UpdateStage::PreChecked)
    {
        let stopped = pipeline.stop_old(pc, true).await;
        if let Err(e) = stopped {
            record_failure(ctx, pc, e, &mut failures)?;
        }
    }

    // Phase 2: create and start all replacements.
    ctx.fire("Starting replacement containers");
    for pc in targets
        .iter_mut()
        .filter(|pc| pc.stage == UpdateStage::Stopped)
    {
        let started = create_and_start(pipeline, pc).await;
        if let Err(e) = started {
            if pipeline.policy().rollback {
                pipeline.rollback(pc).await;
            }
            record_failure(ctx, pc, e, &mut failures)?;
        }
    }

    // Phase 3: verify everything, then retire the old containers.
    for pc in targets
        .iter_mut()
        .filter(|pc| pc.stage == UpdateStage::Started)
    {
        let verified = pipeline.post_check(pc).await;
        match verified {
            Ok(()) => {
                pipeline.delete_old(pc).await;
                pipeline.commit(pc).await;
            }
            Err(e) => {
                if pipeline.policy().rollback {
                    pipeline.rollback(pc).await;
                }
                record_failure(ctx, pc, e, &mut failures)?;
            }
        }
    }

    Ok(failures)
}

async fn prepare(pipeline: &UpdatePipeline<'_>, pc: &mut ProcessedContainer) -> JobOutcome {
    pipeline.load_image(pc).await?;
    pipeline.pre_check(pc).await
}

async fn create_and_start(
    pipeline: &UpdatePipeline<'_>,
    pc: &mut ProcessedContainer,
) -> JobOutcome {
    let name = pc.registration.name.clone();
    pipeline.create_new(pc, &name).await?;
    pipeline.start_new(pc).await
}

/// Count a per-container result, propagating cancellation out of the walk.
fn record_outcome(
    ctx: &JobContext,
    pc: &mut ProcessedContainer,
    result: JobOutcome,
    failures: &mut usize,
) -> Result<(), JobError> {
    match result {
        Ok(()) => Ok(()),
        Err(e) => record_failure(ctx, pc, e, failures),
    }
}

fn record_failure(
    ctx: &JobContext,
    pc: &mut ProcessedContainer,
    error: JobError,
    failures: &mut usize,
) -> Result<(), JobError> {
    match error {
        JobError::Cancelled => Err(JobError::Cancelled),
        JobError::Failed(message) => {
            ctx.fire(format!(
                "{} failed: {}",
                pc.registration.fleet_name(),
                message
            ));
            if pc.stage != UpdateStage::RolledBack {
                pc.stage = UpdateStage::Failed;
            }
            *failures += 1;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DockerConfiguration, UpdateConfiguration};
    use crate::containers::ContainerRegistry;
    use crate::discovery::{ClusterConfig, DiscoveryStorage};
    use crate::events::EventBus;
    use crate::jobs::context::JobServices;
    use crate::jobs::definition::JobParameters;
    use crate::jobs::instance::JobStatus;
    use crate::jobs::manager::JobManager;
    use crate::kv::MemoryKv;
    use crate::node::NodeRegistry;
    use crate::version::VersionComparator;
    use axum::extract::{Path, Query, State};
    use axum::http::StatusCode;
    use axum::routing::{delete, get, post};
    use axum::{Json, Router};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Clone)]
    struct FakeContainer {
        id: String,
        name: String,
        image: String,
        image_id: String,
        running: bool,
    }

    #[derive(Clone, Default)]
    struct FakeDaemon {
        containers: Arc<Mutex<HashMap<String, FakeContainer>>>,
        ops: Arc<Mutex<Vec<String>>>,
        counter: Arc<AtomicU32>,
        /// Container names whose stop requests answer 500.
        fail_stop: Arc<Mutex<std::collections::HashSet<String>>>,
        /// Container names whose rename requests answer 500.
        fail_rename: Arc<Mutex<std::collections::HashSet<String>>>,
    }

    impl FakeDaemon {
        fn fail_stop(&self, name: &str) {
            self.fail_stop.lock().insert(name.to_string());
        }

        fn fail_rename(&self, name: &str) {
            self.fail_rename.lock().insert(name.to_string());
        }

        fn seed(&self, name: &str, image: &str, image_id: &str) {
            let id = format!("seed-{}", name);
            self.containers.lock().insert(
                id.clone(),
                FakeContainer {
                    id,
                    name: name.into(),
                    image: image.into(),
                    image_id: image_id.into(),
                    running: true,
                },
            );
        }

        fn op(&self, line: String) {
            self.ops.lock().push(line);
        }

        fn by_name(&self, name: &str) -> Option<FakeContainer> {
            self.containers
                .lock()
                .values()
                .find(|c| c.name == name)
                .cloned()
        }

        fn ops_index(&self, needle: &str) -> Option<usize> {
            self.ops.lock().iter().position(|op| op.contains(needle))
        }
    }

    #[derive(serde::Deserialize)]
    struct NameQuery {
        name: String,
    }

    fn daemon_router(daemon: FakeDaemon) -> Router {
        Router::new()
            .route(
                "/containers/json",
                get(|State(d): State<FakeDaemon>| async move {
                    let list: Vec<serde_json::Value> = d
                        .containers
                        .lock()
                        .values()
                        .map(|c| {
                            serde_json::json!({
                                "Id": c.id,
                                "Names": [format!("/{}", c.name)],
                                "Image": c.image,
                                "ImageID": c.image_id,
                                "State": if c.running { "running" } else { "exited" },
                                "Status": "",
                            })
                        })
                        .collect();
                    Json(list)
                }),
            )
            .route(
                "/images/create",
                post(|State(d): State<FakeDaemon>| async move {
                    d.op("pull".into());
                    "{\"status\":\"done\"}\n"
                }),
            )
            .route(
                "/containers/:id/json",
                get(|State(d): State<FakeDaemon>, Path(id): Path<String>| async move {
                    match d.containers.lock().get(&id) {
                        Some(c) => (
                            StatusCode::OK,
                            serde_json::json!({
                                "Id": c.id,
                                "Name": format!("/{}", c.name),
                                "Image": c.image_id,
                                "State": {
                                    "Running": c.running,
                                    "Status": if c.running { "running" } else { "exited" },
                                },
                                "Config": {"Image": c.image, "Labels": {}},
                            })
                            .to_string(),
                        ),
                        None => (StatusCode::NOT_FOUND, "no such container".into()),
                    }
                }),
            )
            .route(
                "/containers/:id/stop",
                post(|State(d): State<FakeDaemon>, Path(id): Path<String>| async move {
                    let name = match d.containers.lock().get(&id) {
                        Some(c) => c.name.clone(),
                        None => return StatusCode::NOT_FOUND,
                    };
                    if d.fail_stop.lock().contains(&name) {
                        d.op(format!("stop-fail {}", name));
                        return StatusCode::INTERNAL_SERVER_ERROR;
                    }
                    if let Some(c) = d.containers.lock().get_mut(&id) {
                        c.running = false;
                    }
                    d.op(format!("stop {}", name));
                    StatusCode::NO_CONTENT
                }),
            )
            .route(
                "/containers/:id/start",
                post(|State(d): State<FakeDaemon>, Path(id): Path<String>| async move {
                    let mut containers = d.containers.lock();
                    match containers.get_mut(&id) {
                        Some(c) => {
                            c.running = true;
                            let name = c.name.clone();
                            drop(containers);
                            d.op(format!("start {}", name));
                            StatusCode::NO_CONTENT
                        }
                        None => StatusCode::NOT_FOUND,
                    }
                }),
            )
            .route(
                "/containers/:id/rename",
                post(
                    |State(d): State<FakeDaemon>,
                     Path(id): Path<String>,
                     Query(q): Query<NameQuery>| async move {
                        let old = match d.containers.lock().get(&id) {
                            Some(c) => c.name.clone(),
                            None => return StatusCode::NOT_FOUND,
                        };
                        if d.fail_rename.lock().contains(&old) {
                            d.op(format!("rename-fail {}", old));
                            return StatusCode::INTERNAL_SERVER_ERROR;
                        }
                        if let Some(c) = d.containers.lock().get_mut(&id) {
                            c.name = q.name.clone();
                        }
                        d.op(format!("rename {} {}", old, q.name));
                        StatusCode::NO_CONTENT
                    },
                ),
            )
            .route(
                "/containers/create",
                post(
                    |State(d): State<FakeDaemon>,
                     Query(q): Query<NameQuery>,
                     Json(body): Json<serde_json::Value>| async move {
                        let image = body["Image"].as_str().unwrap_or_default().to_string();
                        let id = format!("c{}", d.counter.fetch_add(1, Ordering::SeqCst));
                        d.op(format!("create {} {}", q.name, image));
                        d.containers.lock().insert(
                            id.clone(),
                            FakeContainer {
                                id: id.clone(),
                                name: q.name,
                                image,
                                image_id: "sha256:new".into(),
                                running: false,
                            },
                        );
                        (
                            StatusCode::CREATED,
                            serde_json::json!({"Id": id}).to_string(),
                        )
                    },
                ),
            )
            .route(
                "/containers/:id",
                delete(|State(d): State<FakeDaemon>, Path(id): Path<String>| async move {
                    match d.containers.lock().remove(&id) {
                        Some(c) => {
                            d.op(format!("remove {}", c.name));
                            StatusCode::NO_CONTENT
                        }
                        None => StatusCode::NOT_FOUND,
                    }
                }),
            )
            .with_state(daemon)
    }

    async fn spawn_daemon(daemon: FakeDaemon) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = daemon_router(daemon);
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr.to_string()
    }

    async fn fixture(address: &str) -> (Arc<JobManager>, JobServices) {
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
        let services = JobServices::new(
            discovery.clone(),
            nodes.clone(),
            containers.clone(),
            events,
            Arc::new(VersionComparator::default()),
            Arc::new(Vec::new()),
            Arc::new(UpdateConfiguration::default()),
        );

        discovery
            .get_or_create_cluster(ClusterConfig::new("testcluster"))
            .await;
        nodes.register("n1", address).await;
        discovery
            .set_node_cluster("n1", Some("testcluster".into()))
            .await
            .unwrap();

        // Prime the registry from the live daemon.
        let service = discovery.get_node_service("n1").unwrap();
        let listing = service.list_containers(true).await.unwrap();
        containers.reconcile("n1", &listing).await;

        let manager = JobManager::new(services.clone(), kv, "f");
        for job_type in update_job_types() {
            manager.register(job_type);
        }
        (manager, services)
    }

    fn seeded_daemon() -> FakeDaemon {
        let daemon = FakeDaemon::default();
        daemon.seed("one-container", "testimage:1", "sha256:one");
        daemon.seed("two-container", "testimage:1", "sha256:two");
        daemon.seed("three-container", "testimage:1", "sha256:three");
        daemon.seed(
            "buggy-container",
            "testimage@sha256:4355a46b19d348dc2f57c046f8ef63d4538ebb936000f3c9ee954a27460dd865",
            "sha256:4355a46b19d348dc2f57c046f8ef63d4538ebb936000f3c9ee954a27460dd865",
        );
        daemon
    }

    fn update_params(cluster: &str) -> JobParameters {
        JobParameters::new()
            .with("cluster", cluster)
            .with("image", "*")
            .with("target_version", "2")
            .with("health_check_enabled", true)
    }

    #[tokio::test]
    async fn test_stop_then_start_all_updates_tagged_containers() {
        let daemon = seeded_daemon();
        let address = spawn_daemon(daemon.clone()).await;
        let (manager, services) = fixture(&address).await;

        let instance = manager
            .submit(JOB_UPDATE_STOP_THEN_START_ALL, update_params("testcluster"))
            .await
            .unwrap();
        assert_eq!(instance.at_end().await, JobStatus::Completed);

        for name in ["one-container", "two-container", "three-container"] {
            let container = daemon.by_name(name).expect(name);
            assert_eq!(container.image, "testimage:2", "{}", name);
            assert!(container.running, "{}", name);
        }
        // The digest-pinned container is skipped by the filter.
        let buggy = daemon.by_name("buggy-container").unwrap();
        assert!(buggy.image.starts_with("testimage@sha256:"));
        assert!(buggy.running);

        // Registry follows the swap.
        let updated = services.containers.find("n1/one-container").unwrap();
        assert_eq!(updated.image, "testimage:2");

        // No stragglers under parked names.
        assert!(daemon
            .containers
            .lock()
            .values()
            .all(|c| !c.name.contains(".old.")));
    }

    #[tokio::test]
    async fn test_start_then_stop_each_keeps_service_up() {
        let daemon = seeded_daemon();
        let address = spawn_daemon(daemon.clone()).await;
        let (manager, _services) = fixture(&address).await;

        let instance = manager
            .submit(
                JOB_UPDATE_START_THEN_STOP_EACH,
                update_params("testcluster"),
            )
            .await
            .unwrap();
        assert_eq!(instance.at_end().await, JobStatus::Completed);

        for name in ["one-container", "two-container", "three-container"] {
            let container = daemon.by_name(name).expect(name);
            assert_eq!(container.image, "testimage:2");
            assert!(container.running);

            // The replacement came up before the old container stopped.
            let started_new = daemon
                .ops_index(&format!("start {}.new", name))
                .expect("replacement start");
            let stopped_old = daemon
                .ops_index(&format!("stop {}", name))
                .expect("old stop");
            assert!(
                started_new < stopped_old,
                "{}: replacement started at op {} but old stopped at {}",
                name,
                started_new,
                stopped_old
            );
        }
    }

    #[tokio::test]
    async fn test_start_then_stop_discards_replacement_when_stop_fails() {
        let daemon = FakeDaemon::default();
        daemon.seed("one-container", "testimage:1", "sha256:one");
        daemon.fail_stop("one-container");
        let address = spawn_daemon(daemon.clone()).await;
        let (manager, services) = fixture(&address).await;

        let instance = manager
            .submit(
                JOB_UPDATE_START_THEN_STOP_EACH,
                update_params("testcluster"),
            )
            .await
            .unwrap();
        assert_eq!(instance.at_end().await, JobStatus::Failed);

        // The old container kept serving on the old image.
        let old = daemon.by_name("one-container").unwrap();
        assert!(old.running);
        assert_eq!(old.image, "testimage:1");

        // The replacement that came up beside it was discarded, not leaked.
        assert!(daemon.by_name("one-container.new").is_none());
        assert_eq!(daemon.containers.lock().len(), 1);

        // The registry still points at the old container.
        let registered = services.containers.find("n1/one-container").unwrap();
        assert_eq!(registered.image, "testimage:1");
    }

    #[tokio::test]
    async fn test_start_then_stop_keeps_replacement_when_rename_fails() {
        let daemon = FakeDaemon::default();
        daemon.seed("one-container", "testimage:1", "sha256:one");
        daemon.fail_rename("one-container.new");
        let address = spawn_daemon(daemon.clone()).await;
        let (manager, services) = fixture(&address).await;

        let instance = manager
            .submit(
                JOB_UPDATE_START_THEN_STOP_EACH,
                update_params("testcluster"),
            )
            .await
            .unwrap();
        assert_eq!(instance.at_end().await, JobStatus::Failed);

        // The old container is gone; the replacement keeps serving under
        // its temp name instead of being stranded or dropped.
        assert!(daemon.by_name("one-container").is_none());
        let replacement = daemon.by_name("one-container.new").unwrap();
        assert!(replacement.running);
        assert_eq!(replacement.image, "testimage:2");

        // The registry tracks the replacement, not the retired container.
        assert!(services.containers.find("n1/one-container").is_none());
        let registered = services.containers.find("n1/one-container.new").unwrap();
        assert_eq!(registered.image, "testimage:2");
    }

    #[tokio::test]
    async fn test_stop_then_start_each_updates_in_place() {
        let daemon = seeded_daemon();
        let address = spawn_daemon(daemon.clone()).await;
        let (manager, _services) = fixture(&address).await;

        let instance = manager
            .submit(
                JOB_UPDATE_STOP_THEN_START_EACH,
                update_params("testcluster"),
            )
            .await
            .unwrap();
        assert_eq!(instance.at_end().await, JobStatus::Completed);

        for name in ["one-container", "two-container", "three-container"] {
            let container = daemon.by_name(name).expect(name);
            assert_eq!(container.image, "testimage:2");
            assert!(container.running);
        }
        // Three replacements plus the untouched digest-pinned container.
        assert_eq!(daemon.containers.lock().len(), 4);
    }

    #[tokio::test]
    async fn test_nothing_matching_completes_quietly() {
        let daemon = FakeDaemon::default();
        daemon.seed("web", "unrelated:2", "sha256:x");
        let address = spawn_daemon(daemon.clone()).await;
        let (manager, _services) = fixture(&address).await;

        let params = JobParameters::new()
            .with("cluster", "testcluster")
            .with("image", "testimage*")
            .with("target_version", "2");
        let instance = manager
            .submit(JOB_UPDATE_STOP_THEN_START_EACH, params)
            .await
            .unwrap();
        assert_eq!(instance.at_end().await, JobStatus::Completed);
        // Nothing was touched.
        assert_eq!(daemon.by_name("web").unwrap().image, "unrelated:2");
    }

    #[tokio::test]
    async fn test_percentage_is_surfaced_and_ignored() {
        let daemon = seeded_daemon();
        let address = spawn_daemon(daemon.clone()).await;
        let (manager, _services) = fixture(&address).await;

        let params = update_params("testcluster").with("percentage", 25.0);
        let instance = manager
            .submit(JOB_UPDATE_STOP_THEN_START_ALL, params)
            .await
            .unwrap();
        assert_eq!(instance.at_end().await, JobStatus::Completed);
        assert!(instance
            .tail()
            .iter()
            .any(|line| line.contains("percentage") && line.contains("ignored")));
    }

    #[test]
    fn test_strategy_name_round_trip() {
        for strategy in [
            UpdateStrategy::StopThenStartEach,
            UpdateStrategy::StartThenStopEach,
            UpdateStrategy::StopThenStartAll,
        ] {
            assert_eq!(
                UpdateStrategy::from_job_type(strategy.job_type_name()),
                Some(strategy)
            );
        }
        assert_eq!(UpdateStrategy::from_job_type("job.other"), None);
    }
}
