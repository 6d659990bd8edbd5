//! Per-container update steps
//!
//! Every strategy drives containers through the same steps: load the
//! target image, gate on the old container's health, stop, create, start,
//! verify. The pipeline owns the step implementations and the rollback;
//! strategies own the ordering. Each step reports progress on the job
//! context and fails only its own container.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::containers::{ContainerBase, ContainerRegistration};
use crate::discovery::ClusterService;
use crate::docker::{ContainerSpec, DockerService, ImageRef, ResultCode};

use super::super::context::JobContext;
use super::super::definition::{JobError, JobOutcome, JobParameters};

/// Knobs shared by all strategies, bound from job parameters.
#[derive(Debug, Clone)]
pub struct UpdatePolicy {
    pub health_check: bool,
    pub rollback: bool,
    /// Grace period before a stop escalates to kill, in seconds.
    pub time_before_kill: u64,
    pub check_timeout: Duration,
    pub check_interval: Duration,
}

impl Default for UpdatePolicy {
    fn default() -> Self {
        Self {
            health_check: true,
            rollback: false,
            time_before_kill: 10,
            check_timeout: Duration::from_secs(60),
            check_interval: Duration::from_millis(500),
        }
    }
}

impl UpdatePolicy {
    pub fn from_params(params: &JobParameters) -> Self {
        let defaults = Self::default();
        Self {
            health_check: params
                .get_bool("health_check_enabled")
                .ok()
                .flatten()
                .unwrap_or(defaults.health_check),
            rollback: params
                .get_bool("rollback_enabled")
                .ok()
                .flatten()
                .unwrap_or(defaults.rollback),
            time_before_kill: params
                .get_i64("time_before_kill")
                .ok()
                .flatten()
                .map(|t| t.max(0) as u64)
                .unwrap_or(defaults.time_before_kill),
            ..defaults
        }
    }
}

/// Where a container is in its update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStage {
    Pending,
    ImageLoaded,
    PreChecked,
    Stopped,
    Created,
    Started,
    Verified,
    RolledBack,
    Failed,
}

/// A container snapshot moving through the pipeline.
pub struct ProcessedContainer {
    pub registration: ContainerRegistration,
    pub target: ImageRef,
    pub stage: UpdateStage,
    pub new_id: Option<String>,
    /// Temp name the replacement was created under, when not the original.
    pub new_name: Option<String>,
    /// Name the old container was parked under before the replacement took
    /// its name.
    pub parked_name: Option<String>,
}

impl ProcessedContainer {
    pub fn new(registration: ContainerRegistration, target_tag: &str) -> Self {
        let target = registration.image_ref().with_tag(target_tag);
        Self {
            registration,
            target,
            stage: UpdateStage::Pending,
            new_id: None,
            new_name: None,
            parked_name: None,
        }
    }

    fn short_id(&self) -> &str {
        let id = &self.registration.id;
        &id[..id.len().min(12)]
    }
}

pub struct UpdatePipeline<'a> {
    ctx: &'a JobContext,
    policy: UpdatePolicy,
    scope: ClusterService,
}

impl<'a> UpdatePipeline<'a> {
    pub fn new(ctx: &'a JobContext, policy: UpdatePolicy, scope: ClusterService) -> Self {
        Self { ctx, policy, scope }
    }

    pub fn policy(&self) -> &UpdatePolicy {
        &self.policy
    }

    /// The endpoint to drive this container through: the cluster aggregate
    /// when there is one, the owning node's client otherwise.
    fn service_for(&self, pc: &ProcessedContainer) -> Result<Arc<DockerService>, JobError> {
        if let Some(aggregate) = self.scope.aggregate() {
            return Ok(aggregate);
        }
        self.ctx
            .services
            .discovery
            .get_node_service(&pc.registration.node)
            .map_err(|e| JobError::Failed(e.to_string()))
    }

    fn check_cancelled(&self) -> JobOutcome {
        if self.ctx.is_cancelled() {
            Err(JobError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Step 1: pull the target image on the owning endpoint.
    pub async fn load_image(&self, pc: &mut ProcessedContainer) -> JobOutcome {
        self.check_cancelled()?;
        let service = self.service_for(pc)?;
        self.ctx.fire(format!(
            "Pulling {} for {}",
            pc.target,
            pc.registration.fleet_name()
        ));
        let token = self.ctx.cancel_token();
        service
            .pull_image(&pc.target, None, &token)
            .await
            .map_err(|e| JobError::Failed(format!("pull {}: {}", pc.target, e)))?;
        self.check_cancelled()?;
        pc.stage = UpdateStage::ImageLoaded;
        Ok(())
    }

    /// Step 2: verify the current container is healthy before touching it.
    pub async fn pre_check(&self, pc: &mut ProcessedContainer) -> JobOutcome {
        if !self.policy.health_check {
            pc.stage = UpdateStage::PreChecked;
            return Ok(());
        }
        self.check_cancelled()?;
        let service = self.service_for(pc)?;
        let details = service
            .inspect_container(&pc.registration.id)
            .await
            .map_err(JobError::from)?
            .ok_or_else(|| {
                JobError::Failed(format!("{} is gone", pc.registration.fleet_name()))
            })?;
        if !details.is_running() {
            return Err(JobError::Failed(format!(
                "{} is not running before update",
                pc.registration.fleet_name()
            )));
        }
        if let Some(health) = details.health_status() {
            if health != "healthy" {
                return Err(JobError::Failed(format!(
                    "{} is {} before update",
                    pc.registration.fleet_name(),
                    health
                )));
            }
        }
        pc.stage = UpdateStage::PreChecked;
        Ok(())
    }

    /// Step 3: stop the old container. With `park`, also move it aside so
    /// the replacement can take its name.
    pub async fn stop_old(&self, pc: &mut ProcessedContainer, park: bool) -> JobOutcome {
        self.check_cancelled()?;
        let service = self.service_for(pc)?;
        self.ctx
            .fire(format!("Stopping {}", pc.registration.fleet_name()));
        match service
            .stop_container(&pc.registration.id, Some(self.policy.time_before_kill))
            .await
        {
            Ok(()) => {}
            // Already stopped is fine.
            Err(e) if e.code == ResultCode::NotModified => {}
            Err(e) => return Err(JobError::Failed(format!("stop: {}", e))),
        }
        if park {
            let parked = format!("{}.old.{}", pc.registration.name, pc.short_id());
            service
                .rename_container(&pc.registration.id, &parked)
                .await
                .map_err(|e| JobError::Failed(format!("park rename: {}", e)))?;
            pc.parked_name = Some(parked);
        }
        pc.stage = UpdateStage::Stopped;
        Ok(())
    }

    /// Step 4: create the replacement under the given name, carrying the
    /// old container's spec with only the image reference changed.
    pub async fn create_new(&self, pc: &mut ProcessedContainer, name: &str) -> JobOutcome {
        self.check_cancelled()?;
        let service = self.service_for(pc)?;
        let mut spec = match service
            .inspect_container(&pc.registration.id)
            .await
            .map_err(JobError::from)?
        {
            Some(details) => details.to_spec(),
            // The old container vanished mid-update; fall back to what the
            // registry remembers.
            None => ContainerSpec {
                labels: if pc.registration.labels.is_empty() {
                    None
                } else {
                    Some(pc.registration.labels.clone())
                },
                ..Default::default()
            },
        };
        spec.image = pc.target.to_string();

        self.ctx
            .fire(format!("Creating {} from {}", name, pc.target));
        let created = service
            .create_container(&spec, Some(name))
            .await
            .map_err(|e| JobError::Failed(format!("create {}: {}", name, e)))?;
        pc.new_id = Some(created.id);
        if name != pc.registration.name {
            pc.new_name = Some(name.to_string());
        }
        pc.stage = UpdateStage::Created;
        Ok(())
    }

    /// Step 5: start the replacement.
    pub async fn start_new(&self, pc: &mut ProcessedContainer) -> JobOutcome {
        self.check_cancelled()?;
        let service = self.service_for(pc)?;
        let new_id = pc
            .new_id
            .clone()
            .ok_or_else(|| JobError::Failed("no replacement to start".into()))?;
        service
            .start_container(&new_id)
            .await
            .map_err(|e| JobError::Failed(format!("start replacement: {}", e)))?;
        pc.stage = UpdateStage::Started;
        Ok(())
    }

    /// Step 6: poll the replacement until it runs healthy, or time out.
    pub async fn post_check(&self, pc: &mut ProcessedContainer) -> JobOutcome {
        if !self.policy.health_check {
            pc.stage = UpdateStage::Verified;
            return Ok(());
        }
        let service = self.service_for(pc)?;
        let new_id = pc
            .new_id
            .clone()
            .ok_or_else(|| JobError::Failed("no replacement to verify".into()))?;
        let deadline = Instant::now() + self.policy.check_timeout;
        loop {
            self.check_cancelled()?;
            if let Some(details) = service.inspect_container(&new_id).await.map_err(JobError::from)? {
                let healthy = details
                    .health_status()
                    .map(|h| h == "healthy")
                    .unwrap_or(true);
                if details.is_running() && healthy {
                    pc.stage = UpdateStage::Verified;
                    self.ctx.fire(format!(
                        "{} verified on {}",
                        pc.registration.fleet_name(),
                        pc.target
                    ));
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(JobError::Failed(format!(
                    "{} did not become healthy within {:?}",
                    pc.registration.fleet_name(),
                    self.policy.check_timeout
                )));
            }
            tokio::time::sleep(self.policy.check_interval).await;
        }
    }

    /// Remove the old container after a successful swap. Failures here are
    /// reported but do not fail the container.
    pub async fn delete_old(&self, pc: &ProcessedContainer) {
        let Ok(service) = self.service_for(pc) else {
            return;
        };
        if let Err(e) = service.delete_container(&pc.registration.id, true, true).await {
            self.ctx.fire(format!(
                "Leaving old {} behind: {}",
                pc.registration.fleet_name(),
                e
            ));
        }
    }

    /// Give the replacement the original name (startThenStop flow).
    pub async fn rename_new_to_original(&self, pc: &mut ProcessedContainer) -> JobOutcome {
        let service = self.service_for(pc)?;
        let new_id = pc
            .new_id
            .clone()
            .ok_or_else(|| JobError::Failed("no replacement to rename".into()))?;
        service
            .rename_container(&new_id, &pc.registration.name)
            .await
            .map_err(|e| JobError::Failed(format!("rename replacement: {}", e)))?;
        pc.new_name = None;
        Ok(())
    }

    /// Swap the registry entry: the replacement takes over the identity,
    /// under whatever name it currently carries.
    pub async fn commit(&self, pc: &ProcessedContainer) {
        let Some(new_id) = pc.new_id.clone() else {
            return;
        };
        self.ctx
            .services
            .containers
            .remove(&pc.registration.id)
            .await;
        self.ctx
            .services
            .containers
            .get_or_create(
                &ContainerBase {
                    id: new_id,
                    name: pc
                        .new_name
                        .clone()
                        .unwrap_or_else(|| pc.registration.name.clone()),
                    image: pc.target.to_string(),
                    image_id: None,
                },
                &pc.registration.node,
            )
            .await;
    }

    /// Drop a replacement that never took over (startThenStop flow, before
    /// the old container was touched).
    pub async fn discard_new(&self, pc: &mut ProcessedContainer) {
        let Ok(service) = self.service_for(pc) else {
            return;
        };
        if let Some(new_id) = pc.new_id.take() {
            let _ = service.stop_container(&new_id, Some(0)).await;
            let _ = service.delete_container(&new_id, true, true).await;
        }
        pc.new_name = None;
    }

    /// Reverse a failed swap: drop the replacement if any, un-park the old
    /// container and start it again.
    pub async fn rollback(&self, pc: &mut ProcessedContainer) {
        let Ok(service) = self.service_for(pc) else {
            return;
        };
        self.ctx
            .fire(format!("Rolling back {}", pc.registration.fleet_name()));

        if let Some(new_id) = pc.new_id.take() {
            let _ = service.stop_container(&new_id, Some(0)).await;
            let _ = service.delete_container(&new_id, true, true).await;
        }
        if pc.parked_name.take().is_some() {
            if let Err(e) = service
                .rename_container(&pc.registration.id, &pc.registration.name)
                .await
            {
                self.ctx.fire(format!("Rollback rename failed: {}", e));
            }
        }
        match service.start_container(&pc.registration.id).await {
            Ok(()) => pc.stage = UpdateStage::RolledBack,
            Err(e) => {
                self.ctx.fire(format!(
                    "Rollback start of {} failed: {}",
                    pc.registration.fleet_name(),
                    e
                ));
                pc.stage = UpdateStage::Failed;
            }
        }
    }
}
