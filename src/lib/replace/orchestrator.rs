//! Swaps a container for a new one under the same name, restoring the
//! original when anything after the backup rename fails.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::state::valid_state_transition;
use super::types::{ReplaceError, ReplaceRequest, ReplacementJob, ReplacementState};
use crate::lib::errors::classifier::classify;
use crate::lib::pull::pipeline::PullPipeline;
use crate::lib::pull::types::{ImageKey, ProgressSink};
use crate::lib::runtime::types::{ContainerRuntime, RuntimeError};

type Jobs = Arc<Mutex<HashMap<String, ReplacementJob>>>;

fn lock(jobs: &Jobs) -> MutexGuard<'_, HashMap<String, ReplacementJob>> {
    jobs.lock().unwrap_or_else(|e| e.into_inner())
}

fn runtime_failure(action: &str, subject: &str, err: RuntimeError) -> ReplaceError {
    ReplaceError::Runtime(classify(action, subject, &err.message))
}

/// Exclusive claim on a source container. Dropping it ends the job.
pub struct JobGuard {
    source_id: String,
    task_id: String,
    jobs: Jobs,
}

impl JobGuard {
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    fn publish(&self, job: &ReplacementJob) {
        lock(&self.jobs).insert(self.source_id.clone(), job.clone());
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        let mut jobs = lock(&self.jobs);
        if jobs
            .get(&self.source_id)
            .is_some_and(|job| job.task_id == self.task_id)
        {
            jobs.remove(&self.source_id);
        }
    }
}

/// Pull progress belongs to the replacement, so terminal pull events are
/// demoted to log lines and percentages are dropped.
struct NestedPullSink<'a> {
    inner: &'a dyn ProgressSink,
}

#[async_trait]
impl ProgressSink for NestedPullSink<'_> {
    async fn on_progress(&self, _percent: u8) {}

    async fn on_log(&self, line: &str) {
        self.inner.on_log(line).await;
    }

    async fn on_complete(&self) {
        self.inner.on_log("Image pulled").await;
    }

    async fn on_error(&self, detail: &str) {
        self.inner.on_log(detail).await;
    }
}

pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    pipeline: Arc<PullPipeline>,
    jobs: Jobs,
}

impl Orchestrator {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, pipeline: Arc<PullPipeline>) -> Self {
        Orchestrator {
            runtime,
            pipeline,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Claim the container named or identified by `container`. Jobs are keyed
    /// by the runtime id, so a name and an id of the same container collide.
    pub async fn claim(&self, container: &str, task_id: &str) -> Result<JobGuard, ReplaceError> {
        let current = self
            .runtime
            .inspect_container(container)
            .await
            .map_err(|e| runtime_failure("inspect container", container, e))?;
        self.begin(&current.id, task_id)
    }

    /// Claim `source_id`. Only one replacement per source may be active.
    fn begin(&self, source_id: &str, task_id: &str) -> Result<JobGuard, ReplaceError> {
        let mut jobs = lock(&self.jobs);
        if jobs.contains_key(source_id) {
            return Err(ReplaceError::AlreadyActive(source_id.to_string()));
        }
        jobs.insert(source_id.to_string(), ReplacementJob::new(source_id, task_id));
        Ok(JobGuard {
            source_id: source_id.to_string(),
            task_id: task_id.to_string(),
            jobs: self.jobs.clone(),
        })
    }

    pub fn jobs(&self) -> Vec<ReplacementJob> {
        lock(&self.jobs).values().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        lock(&self.jobs).len()
    }

    pub async fn run(
        &self,
        guard: JobGuard,
        request: &ReplaceRequest,
        sink: &dyn ProgressSink,
    ) -> Result<ReplacementJob, ReplaceError> {
        let mut job = ReplacementJob::new(&guard.source_id, &guard.task_id);
        info!(container = %guard.source_id, task_id = %guard.task_id, "Starting replacement");

        match self.execute(&guard, &mut job, request, sink).await {
            Ok(()) => {
                info!(container = %guard.source_id, new_id = ?job.new_container_id, "Replacement committed");
                sink.on_complete().await;
                Ok(job)
            }
            Err(err) => {
                warn!(
                    container = %guard.source_id,
                    state = ?job.state,
                    error = %err,
                    "Replacement failed"
                );
                if job.backup_name.is_some() {
                    self.rollback(&guard, &mut job, sink).await;
                }
                job.state = ReplacementState::Failed;
                job.error = Some(err.user_message());
                guard.publish(&job);
                sink.on_error(&err.user_message()).await;
                Err(err)
            }
        }
    }

    async fn advance(
        &self,
        guard: &JobGuard,
        job: &mut ReplacementJob,
        to: ReplacementState,
        sink: &dyn ProgressSink,
    ) -> Result<(), ReplaceError> {
        if !valid_state_transition(&job.state, &to) {
            return Err(ReplaceError::IllegalTransition { from: job.state, to });
        }
        job.state = to;
        guard.publish(job);
        sink.on_progress(to.progress()).await;
        Ok(())
    }

    async fn execute(
        &self,
        guard: &JobGuard,
        job: &mut ReplacementJob,
        request: &ReplaceRequest,
        sink: &dyn ProgressSink,
    ) -> Result<(), ReplaceError> {
        if let (true, Some(image)) = (request.pull, &request.overrides.image) {
            sink.on_log(&format!("Pulling image {}", image)).await;
            let ticket = self.pipeline.begin(ImageKey::parse(image), &guard.task_id)?;
            self.pipeline
                .pull(ticket, &NestedPullSink { inner: sink })
                .await?;
        }

        let source = &guard.source_id;
        guard.publish(job);
        sink.on_progress(ReplacementState::Stopping.progress()).await;

        let current = self
            .runtime
            .inspect_container(source)
            .await
            .map_err(|e| runtime_failure("inspect container", source, e))?;
        job.original_id = Some(current.id.clone());
        job.container_name = Some(current.name.clone());
        if current.running {
            sink.on_log(&format!("Stopping container {}", current.name)).await;
            self.runtime
                .stop_container(&current.id)
                .await
                .map_err(|e| runtime_failure("stop container", &current.name, e))?;
        }

        let snapshot = self
            .runtime
            .inspect_container(&current.id)
            .await
            .map_err(|e| runtime_failure("inspect container", &current.name, e))?;
        self.advance(guard, job, ReplacementState::ConfigCaptured, sink).await?;

        let backup = self.free_backup_name(&snapshot.name).await?;
        self.runtime
            .rename_container(&snapshot.id, &backup)
            .await
            .map_err(|e| runtime_failure("rename container", &snapshot.name, e))?;
        sink.on_log(&format!("Renamed {} to {}", snapshot.name, backup)).await;
        job.backup_name = Some(backup);
        self.advance(guard, job, ReplacementState::BackedUp, sink).await?;

        self.advance(guard, job, ReplacementState::Creating, sink).await?;
        let spec = request.overrides.apply(snapshot.spec.clone());
        sink.on_log(&format!("Creating {} from {}", snapshot.name, spec.image)).await;
        let new_id = self
            .runtime
            .create_container(&snapshot.name, &spec)
            .await
            .map_err(|e| runtime_failure("create container", &snapshot.name, e))?;
        job.new_container_id = Some(new_id.clone());
        guard.publish(job);
        self.runtime
            .start_container(&new_id)
            .await
            .map_err(|e| runtime_failure("start container", &snapshot.name, e))?;

        self.advance(guard, job, ReplacementState::Validating, sink).await?;
        let created = self
            .runtime
            .inspect_container(&new_id)
            .await
            .map_err(|e| runtime_failure("inspect container", &snapshot.name, e))?;
        if !created.running {
            return Err(ReplaceError::NotRunning(snapshot.name.clone()));
        }

        if let Err(e) = self.runtime.remove_container(&snapshot.id, true).await {
            warn!(container = %snapshot.id, error = %e, "Failed to remove backup container");
            sink.on_log(&format!("Backup container could not be removed: {}", e)).await;
        }
        self.advance(guard, job, ReplacementState::Committed, sink).await
    }

    /// `<name>_backup`, then `<name>_backup_1`, `_2`... until unused.
    async fn free_backup_name(&self, name: &str) -> Result<String, ReplaceError> {
        let containers = self
            .runtime
            .list_containers()
            .await
            .map_err(|e| runtime_failure("list containers", name, e))?;
        let taken = |candidate: &str| containers.iter().any(|c| c.has_name(candidate));

        let mut candidate = format!("{}_backup", name);
        let mut n = 0;
        while taken(&candidate) {
            n += 1;
            candidate = format!("{}_backup_{}", name, n);
        }
        Ok(candidate)
    }

    /// Restore the backup under its original name. Failures are logged only.
    async fn rollback(&self, guard: &JobGuard, job: &mut ReplacementJob, sink: &dyn ProgressSink) {
        let (Some(original_id), Some(name)) = (job.original_id.clone(), job.container_name.clone())
        else {
            return;
        };
        job.state = ReplacementState::RollingBack;
        guard.publish(job);
        sink.on_log(&format!("Rolling back {}", name)).await;
        info!(container = %name, "Rolling back replacement");

        let mut doomed: Vec<String> = job.new_container_id.iter().cloned().collect();
        match self.runtime.list_containers().await {
            Ok(containers) => doomed.extend(
                containers
                    .into_iter()
                    .filter(|c| c.has_name(&name) && c.id != original_id)
                    .map(|c| c.id),
            ),
            Err(e) => warn!(error = %e, "Failed to list containers during rollback"),
        }
        doomed.dedup();
        for id in &doomed {
            if let Err(e) = self.runtime.remove_container(id, true).await {
                error!(container = %id, error = %e, "Rollback could not remove new container");
            }
        }

        if let Err(e) = self.runtime.rename_container(&original_id, &name).await {
            error!(container = %original_id, name = %name, error = %e, "Rollback rename failed");
            return;
        }
        if let Err(e) = self.runtime.start_container(&original_id).await {
            error!(container = %original_id, error = %e, "Rollback start failed");
            return;
        }
        sink.on_log(&format!("Restored original container {}", name)).await;
    }
}
