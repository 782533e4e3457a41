//! Job lifecycle: create, start, stop and read jobs and their pods.

use std::ops::Range;
use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{info, warn};

use marshal_runtime::{HealthEvaluator, TaskOperator};
use marshal_state::{
    epoch_millis, Commit, EntityVersion, JobGoal, JobRecord, JobSpec, JobState, PodInfo,
    StateStore,
};

use crate::engine::EngineSettings;
use crate::error::{UpdateError, UpdateResult};
use crate::executor::{fresh_pod, BatchExecutor, ExecutorSettings};
use crate::version;

#[derive(Clone)]
pub struct JobManager {
    store: StateStore,
    executor: BatchExecutor,
    settings: ExecutorSettings,
}

impl JobManager {
    pub fn new(
        store: StateStore,
        operator: Arc<dyn TaskOperator>,
        health: Arc<dyn HealthEvaluator>,
        settings: &EngineSettings,
    ) -> Self {
        Self {
            executor: BatchExecutor::new(store.clone(), operator, health),
            store,
            settings: settings.executor_settings(&Default::default()),
        }
    }

    /// Create a job at config version 1 and launch its instances.
    pub async fn create_job(&self, job_id: &str, spec: JobSpec) -> UpdateResult<EntityVersion> {
        validate_job_id(job_id)?;
        version::validate_spec(&spec)?;
        if self.store.get_job(job_id)?.is_some() {
            return Err(UpdateError::InvalidState(format!(
                "job {job_id} already exists"
            )));
        }

        let now = epoch_millis();
        let record = JobRecord {
            id: job_id.to_string(),
            config_version: 1,
            desired_state_version: 1,
            workflow_version: 0,
            goal: JobGoal::Running,
            state: JobState::Initialized,
            created_at: now,
            updated_at: now,
        };
        let mut commit = Commit::new().create_job(record.clone());
        for instance_id in 0..spec.instance_count {
            commit = commit.put_pod(fresh_pod(
                job_id,
                instance_id,
                spec.effective_spec(instance_id),
                1,
            ));
        }
        self.store.commit(commit.put_config(job_id, 1, spec))?;
        info!(job = %job_id, "job created");

        self.launch_all(job_id).await?;
        self.set_state(job_id, JobState::Running)?;
        Ok(record.entity_version())
    }

    /// Set the goal to running and launch every instance with its recorded spec.
    pub async fn start_job(&self, job_id: &str, entity_version: &str) -> UpdateResult<EntityVersion> {
        let next = self.change_goal(job_id, entity_version, JobGoal::Running)?;
        self.launch_all(job_id).await?;
        self.set_state(job_id, JobState::Running)?;
        info!(job = %job_id, version = %next, "job started");
        Ok(next)
    }

    /// Set the goal to killed and kill every instance.
    pub async fn stop_job(&self, job_id: &str, entity_version: &str) -> UpdateResult<EntityVersion> {
        let next = self.change_goal(job_id, entity_version, JobGoal::Killed)?;
        let pods = self.store.list_pods_for_job(job_id)?;
        let results = join_all(
            pods.iter()
                .map(|pod| self.executor.retire(job_id, pod.instance_id)),
        )
        .await;
        for (pod, result) in pods.iter().zip(results) {
            if let Err(reason) = result {
                warn!(pod = %pod.pod_id(), %reason, "failed to kill instance");
            }
        }
        self.set_state(job_id, JobState::Killed)?;
        info!(job = %job_id, version = %next, "job stopped");
        Ok(next)
    }

    /// Stop the instances in `instances` and leave the rest of the job alone.
    ///
    /// Bumps the desired-state version. Stopped instances stay stopped until
    /// the job is started again or an update replaces them.
    pub async fn stop_instances(
        &self,
        job_id: &str,
        instances: Range<u32>,
        entity_version: &str,
    ) -> UpdateResult<EntityVersion> {
        let presented = version::parse(entity_version)?;
        let job = self.get_job(job_id)?;
        version::check(&job, presented)?;
        let count = self.get_job_spec(job_id, None)?.instance_count;
        if instances.is_empty() || instances.end > count {
            return Err(UpdateError::InvalidArgument(format!(
                "instance range {}..{} is empty or outside 0..{count}",
                instances.start, instances.end
            )));
        }

        let next = version::with_goal(&job, job.goal, epoch_millis());
        self.store
            .commit(Commit::new().put_job(next.clone(), presented))?;

        let ids: Vec<u32> = instances.collect();
        match self.executor.stop(job_id, &ids).await {
            Ok(stopped) => {
                info!(job = %job_id, instances = ids.len(), stopped, "instances stopped")
            }
            Err(reason) => warn!(job = %job_id, %reason, "failed to stop instances"),
        }
        Ok(next.entity_version())
    }

    pub fn get_job(&self, job_id: &str) -> UpdateResult<JobRecord> {
        self.store
            .get_job(job_id)?
            .ok_or_else(|| UpdateError::NotFound(format!("job {job_id}")))
    }

    /// A job's spec at `version`, or the version currently in force.
    pub fn get_job_spec(&self, job_id: &str, version: Option<u64>) -> UpdateResult<JobSpec> {
        let version = match version {
            Some(v) => v,
            None => self.get_job(job_id)?.config_version,
        };
        self.store
            .get_job_config(job_id, version)?
            .ok_or_else(|| UpdateError::NotFound(format!("job {job_id} config version {version}")))
    }

    pub fn query_pods(&self, job_id: &str) -> UpdateResult<Vec<PodInfo>> {
        self.get_job(job_id)?;
        Ok(self.store.list_pods_for_job(job_id)?)
    }

    pub fn get_pod(&self, job_id: &str, instance_id: u32) -> UpdateResult<PodInfo> {
        self.store
            .get_pod(job_id, instance_id)?
            .ok_or_else(|| UpdateError::NotFound(format!("pod {job_id}/{instance_id}")))
    }

    fn change_goal(
        &self,
        job_id: &str,
        entity_version: &str,
        goal: JobGoal,
    ) -> UpdateResult<EntityVersion> {
        let presented = version::parse(entity_version)?;
        let job = self.get_job(job_id)?;
        version::check(&job, presented)?;
        let next = version::with_goal(&job, goal, epoch_millis());
        self.store
            .commit(Commit::new().put_job(next.clone(), presented))?;
        Ok(next.entity_version())
    }

    async fn launch_all(&self, job_id: &str) -> UpdateResult<()> {
        let pods = self.store.list_pods_for_job(job_id)?;
        let results = join_all(pods.iter().map(|pod| {
            self.executor.converge(
                job_id,
                pod.instance_id,
                pod.spec.clone(),
                pod.spec_version,
                &self.settings,
            )
        }))
        .await;
        for (pod, result) in pods.iter().zip(results) {
            if let Err(reason) = result {
                warn!(job = %job_id, instance = pod.instance_id, %reason, "instance failed to start");
            }
        }
        Ok(())
    }

    /// Record the observed job state. Not part of the entity version.
    fn set_state(&self, job_id: &str, state: JobState) -> UpdateResult<()> {
        let job = self.get_job(job_id)?;
        let expected = job.entity_version();
        let next = JobRecord {
            state,
            updated_at: epoch_millis(),
            ..job
        };
        match self.store.commit(Commit::new().put_job(next, expected)) {
            Err(e) if e.is_conflict() => {
                warn!(job = %job_id, ?state, "job changed while recording its state");
                Ok(())
            }
            other => Ok(other?),
        }
    }
}

/// Job ids key pod records as `{job}:{instance}`.
fn validate_job_id(job_id: &str) -> UpdateResult<()> {
    if job_id.trim().is_empty() || job_id.contains(':') {
        return Err(UpdateError::InvalidArgument(format!(
            "job id {job_id:?} must be non-empty and free of ':'"
        )));
    }
    Ok(())
}
