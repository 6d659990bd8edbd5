//! Job manager
//!
//! Registry of job types, index of live instances, and the runner that
//! drives an instance through its lifecycle on a tokio task. Periodic jobs
//! are driven by a ticker; a tick is skipped while the previous instance
//! of the same type is still running.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ControlError, Result};
use crate::kv::{self, KvStore};

use super::context::{JobContext, JobServices};
use super::definition::{JobError, JobParameters, JobScope, JobType};
use super::instance::{JobInstance, JobRecord, JobStatus};

pub struct JobManager {
    types: DashMap<String, Arc<JobType>>,
    instances: DashMap<String, Arc<JobInstance>>,
    services: JobServices,
    kv: Arc<dyn KvStore>,
    prefix: String,
}

impl JobManager {
    pub fn new(services: JobServices, kv: Arc<dyn KvStore>, prefix: impl Into<String>) -> Arc<Self> {
        let manager = Arc::new(Self {
            types: DashMap::new(),
            instances: DashMap::new(),
            services,
            kv,
            prefix: prefix.into(),
        });
        manager.services.set_manager(&manager);
        manager
    }

    pub fn register(&self, job_type: JobType) {
        debug!("Registered job type {}", job_type.name);
        self.types.insert(job_type.name.clone(), Arc::new(job_type));
    }

    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.iter().map(|t| t.key().clone()).collect();
        names.sort();
        names
    }

    fn checkpoint_key(&self, id: &str) -> String {
        format!("{}/jobs/{}", self.prefix, id)
    }

    async fn checkpoint(&self, instance: &JobInstance) {
        let record = instance.record();
        if let Err(e) = kv::put_json(self.kv.as_ref(), &self.checkpoint_key(&record.id), &record).await
        {
            warn!("Failed to checkpoint job {}: {}", record.id, e);
        }
    }

    /// Whether a non-repeatable type already has a live instance in the
    /// given scope.
    fn scope_occupied(&self, job_type: &JobType, parameters: &JobParameters) -> bool {
        let cluster = parameters.get_str("cluster").ok().flatten();
        self.instances.iter().any(|entry| {
            let other = entry.value();
            if other.type_name != job_type.name || other.status().is_terminal() {
                return false;
            }
            match job_type.scope {
                JobScope::Unrestricted => true,
                JobScope::Cluster => {
                    other.parameters.get_str("cluster").ok().flatten() == cluster
                }
            }
        })
    }

    /// Create an instance. Non-repeatable types conflict while a prior
    /// instance in the same scope is non-terminal.
    pub async fn create(
        &self,
        type_name: &str,
        parameters: JobParameters,
    ) -> Result<Arc<JobInstance>> {
        let job_type = self
            .types
            .get(type_name)
            .map(|t| t.clone())
            .ok_or_else(|| ControlError::NotFound(format!("job type {}", type_name)))?;

        if !job_type.repeatable && self.scope_occupied(&job_type, &parameters) {
            return Err(ControlError::Conflict(format!(
                "job type {} already has a running instance in this scope",
                type_name
            )));
        }

        let instance = JobInstance::new(type_name, parameters, self.services.events.clone());
        self.instances.insert(instance.id.clone(), instance.clone());
        self.checkpoint(&instance).await;
        info!("Created job {} ({})", instance.id, type_name);
        Ok(instance)
    }

    /// Start a created instance on its own task.
    pub fn start(self: &Arc<Self>, id: &str) -> Result<()> {
        let instance = self
            .get(id)
            .ok_or_else(|| ControlError::NotFound(format!("job {}", id)))?;
        if !instance.try_advance(JobStatus::Started, None) {
            return Err(ControlError::Conflict(format!(
                "job {} was already started",
                id
            )));
        }

        let manager = self.clone();
        tokio::spawn(async move {
            manager.run(instance).await;
        });
        Ok(())
    }

    /// Convenience: create and immediately start.
    pub async fn submit(
        self: &Arc<Self>,
        type_name: &str,
        parameters: JobParameters,
    ) -> Result<Arc<JobInstance>> {
        let instance = self.create(type_name, parameters).await?;
        self.start(&instance.id)?;
        Ok(instance)
    }

    async fn run(&self, instance: Arc<JobInstance>) {
        let job_type = match self.types.get(&instance.type_name).map(|t| t.clone()) {
            Some(t) => t,
            None => {
                instance.try_advance(
                    JobStatus::Failed,
                    Some(format!("job type {} vanished", instance.type_name)),
                );
                self.checkpoint(&instance).await;
                return;
            }
        };
        self.checkpoint(&instance).await;

        // Parameter resolution happens before the handler runs; a violation
        // fails the instance without invoking it.
        if let Err(message) = job_type.schema.validate(&instance.parameters) {
            instance.fire(format!("parameter error: {}", message));
            instance.try_advance(JobStatus::Failed, Some(message));
            self.checkpoint(&instance).await;
            return;
        }

        instance.try_advance(JobStatus::Running, None);
        let ctx = JobContext::new(instance.clone(), self.services.clone());
        let outcome = job_type.handler.execute(&ctx).await;

        let advanced = match outcome {
            Ok(()) if instance.is_cancel_requested() => {
                instance.try_advance(JobStatus::Cancelled, None)
            }
            Ok(()) => instance.try_advance(JobStatus::Completed, None),
            Err(JobError::Cancelled) => instance.try_advance(JobStatus::Cancelled, None),
            Err(JobError::Failed(message)) => {
                instance.fire(format!("failed: {}", message));
                instance.try_advance(JobStatus::Failed, Some(message))
            }
        };
        if advanced {
            debug!("Job {} ended as {}", instance.id, instance.status());
        }
        self.checkpoint(&instance).await;
    }

    /// Request cancellation of a live instance.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        let instance = self
            .get(id)
            .ok_or_else(|| ControlError::NotFound(format!("job {}", id)))?;
        instance.cancel();
        // An instance that never started has no task to observe the token.
        if instance.status() == JobStatus::Created {
            instance.try_advance(JobStatus::Cancelled, None);
            self.checkpoint(&instance).await;
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<JobInstance>> {
        self.instances.get(id).map(|i| i.clone())
    }

    pub fn list(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> =
            self.instances.iter().map(|i| i.record()).collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    /// Drive a periodic job type. Ticks while a prior instance is live are
    /// suppressed; the loop ends when `shutdown` fires.
    pub fn schedule_periodic(
        self: &Arc<Self>,
        type_name: &str,
        parameters: JobParameters,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        let manager = self.clone();
        let type_name = type_name.to_string();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so the plane
            // finishes booting before periodic work starts.
            ticker.tick().await;
            info!(
                "Scheduled periodic job {} every {:?}",
                type_name, interval
            );
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Periodic job {} stopping", type_name);
                        return;
                    }
                    _ = ticker.tick() => {}
                }

                let busy = manager.instances.iter().any(|entry| {
                    entry.type_name == type_name && !entry.status().is_terminal()
                });
                if busy {
                    debug!("Periodic job {} still running, tick suppressed", type_name);
                    continue;
                }

                match manager.submit(&type_name, parameters.clone()).await {
                    Ok(instance) => {
                        instance.at_end().await;
                    }
                    Err(ControlError::Conflict(_)) => {}
                    Err(e) => error!("Periodic job {} failed to start: {}", type_name, e),
                }
            }
        });
    }
}
