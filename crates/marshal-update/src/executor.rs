//! Batch executor: applies one wave of instance changes.
//!
//! Every instance in a wave is driven concurrently until it converges:
//! running (and passing its health check, when one is enabled) or out of
//! attempts. The executor records each attempt on the pod so a crash
//! mid-wave leaves enough behind to re-dispatch the wave safely.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tracing::{debug, info, warn};

use marshal_runtime::{HealthEvaluator, HealthVerdict, LaunchRequest, TaskOperator};
use marshal_state::{
    epoch_millis, HostState, InstanceChange, JobSpec, PlannedInstance, PodInfo, PodSpec,
    PodState, StateResult, StateStore,
};

use crate::machine::WaveOutcome;

/// Knobs for driving one instance.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub max_attempts: u32,
    /// Upper bound on one attempt, launch through health verdict. A health
    /// check's initial interval is added on top.
    pub instance_timeout: Duration,
    pub health_poll_interval: Duration,
    /// Pass each pod's current host as a placement hint.
    pub in_place: bool,
}

#[derive(Clone)]
pub struct BatchExecutor {
    store: StateStore,
    operator: Arc<dyn TaskOperator>,
    health: Arc<dyn HealthEvaluator>,
}

impl BatchExecutor {
    pub fn new(
        store: StateStore,
        operator: Arc<dyn TaskOperator>,
        health: Arc<dyn HealthEvaluator>,
    ) -> Self {
        Self {
            store,
            operator,
            health,
        }
    }

    /// Dispatch every instance of `wave` concurrently and wait for all of them.
    pub async fn run_wave(
        &self,
        job_id: &str,
        target: &JobSpec,
        target_version: u64,
        wave: &[PlannedInstance],
        settings: &ExecutorSettings,
    ) -> WaveOutcome {
        let results = join_all(wave.iter().map(|planned| async move {
            let result = match planned.change {
                InstanceChange::Unchanged => Ok(()),
                InstanceChange::Removed => self.retire(job_id, planned.instance_id).await,
                InstanceChange::Added | InstanceChange::Modified => {
                    let spec = target.effective_spec(planned.instance_id);
                    self.converge(job_id, planned.instance_id, spec, target_version, settings)
                        .await
                }
            };
            (planned.instance_id, result)
        }))
        .await;

        let mut outcome = WaveOutcome::default();
        for (instance_id, result) in results {
            match result {
                Ok(()) => outcome.converged.push(instance_id),
                Err(reason) => outcome.failed.push((instance_id, reason)),
            }
        }
        outcome
    }

    /// Run `spec` on an instance, replacing its current run.
    ///
    /// An instance already running `spec` at `spec_version` is left alone.
    /// Returns the last failure reason once every attempt is spent.
    pub async fn converge(
        &self,
        job_id: &str,
        instance_id: u32,
        spec: PodSpec,
        spec_version: u64,
        settings: &ExecutorSettings,
    ) -> Result<(), String> {
        let existing = self
            .store
            .get_pod(job_id, instance_id)
            .map_err(|e| e.to_string())?;
        if let Some(pod) = &existing {
            if pod.spec_version == spec_version && pod.spec == spec && pod.state == PodState::Running
            {
                debug!(job = %job_id, instance = instance_id, "instance already converged");
                return Ok(());
            }
        }

        let mut pod =
            existing.unwrap_or_else(|| fresh_pod(job_id, instance_id, spec.clone(), spec_version));
        let hint = if settings.in_place { pod.host.clone() } else { None };
        let max_attempts = settings.max_attempts.max(1);
        let budget = settings.instance_timeout
            + spec
                .health_check()
                .map(|h| Duration::from_secs(u64::from(h.initial_interval_secs)))
                .unwrap_or_default();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            self.kill_if_resident(&pod).await;

            pod.run_id += 1;
            pod.spec = spec.clone();
            pod.spec_version = spec_version;
            pod.attempts = attempt;
            pod.state = PodState::Launched;
            pod.host = None;
            pod.failure_reason = None;
            self.persist(&mut pod)?;

            let verdict =
                tokio::time::timeout(budget, self.attempt(&mut pod, hint.clone(), settings)).await;

            match verdict {
                Ok(Ok(())) => {
                    pod.state = PodState::Running;
                    self.persist(&mut pod)?;
                    info!(pod = %pod.pod_id(), host = ?pod.host, attempt, "instance converged");
                    return Ok(());
                }
                Ok(Err(reason)) => last_error = reason,
                Err(_) => last_error = format!("no verdict within {}s", budget.as_secs_f64()),
            }

            self.kill_if_resident(&pod).await;
            if pod.state != PodState::Pending {
                pod.state = PodState::Failed;
            }
            pod.failure_reason = Some(last_error.clone());
            self.persist(&mut pod)?;
            warn!(
                pod = %pod.pod_id(),
                attempt,
                max_attempts,
                reason = %last_error,
                "instance attempt failed"
            );
        }

        Err(last_error)
    }

    async fn attempt(
        &self,
        pod: &mut PodInfo,
        placement_hint: Option<String>,
        settings: &ExecutorSettings,
    ) -> Result<(), String> {
        let pod_id = pod.pod_id();
        let launched = self
            .operator
            .launch(LaunchRequest {
                pod_id: pod_id.clone(),
                job_id: pod.job_id.clone(),
                instance_id: pod.instance_id,
                spec: pod.spec.clone(),
                placement_hint,
            })
            .await
            .map_err(|e| format!("launch failed: {e}"))?;

        pod.host = launched.host;
        match launched.state {
            PodState::Running => pod.state = PodState::Launched,
            PodState::Pending => {
                pod.state = PodState::Pending;
                self.persist(pod)?;
                return Err("no host satisfies the placement constraint".to_string());
            }
            other => {
                pod.state = other;
                return Err(format!("pod ended in {other:?}"));
            }
        }

        // Record the placement before looking at the host, so a drain that
        // starts in between either sees this pod or is seen here.
        self.persist(pod)?;
        if let Some(host) = pod.host.clone() {
            let state = self
                .store
                .get_host(&host)
                .map_err(|e| format!("failed to read host {host}: {e}"))?
                .map(|h| h.state);
            if state != Some(HostState::Up) {
                return Err(format!("host {host} left service during launch"));
            }
        }

        let Some(check) = pod.spec.health_check().cloned() else {
            return Ok(());
        };
        let check_timeout = Duration::from_secs(u64::from(check.timeout_secs.max(1)));

        pod.state = PodState::Starting;
        self.persist(pod)?;
        loop {
            let verdict = tokio::time::timeout(check_timeout, self.health.evaluate(&pod_id))
                .await
                .map_err(|_| format!("health check timed out after {}s", check_timeout.as_secs()))?;
            match verdict {
                Ok(HealthVerdict::Pass) => return Ok(()),
                Ok(HealthVerdict::Fail) => return Err("health check failed".to_string()),
                Ok(HealthVerdict::Pending) => {
                    tokio::time::sleep(settings.health_poll_interval).await;
                }
                Err(e) => return Err(format!("health evaluation failed: {e}")),
            }
        }
    }

    /// Kill an instance's run. The record stays until pods are reconciled.
    pub async fn retire(&self, job_id: &str, instance_id: u32) -> Result<(), String> {
        let Some(mut pod) = self
            .store
            .get_pod(job_id, instance_id)
            .map_err(|e| e.to_string())?
        else {
            return Ok(());
        };
        if pod.state.is_resident() {
            self.operator
                .kill(&[pod.pod_id()])
                .await
                .map_err(|e| format!("kill failed: {e}"))?;
        }
        pod.state = PodState::Killed;
        pod.host = None;
        self.persist(&mut pod)?;
        debug!(pod = %pod.pod_id(), "instance retired");
        Ok(())
    }

    /// Gracefully stop instances in one operator call and mark them killed.
    /// Returns how many were still on a host.
    pub async fn stop(&self, job_id: &str, instance_ids: &[u32]) -> Result<usize, String> {
        let mut pods = Vec::with_capacity(instance_ids.len());
        for &instance_id in instance_ids {
            if let Some(pod) = self
                .store
                .get_pod(job_id, instance_id)
                .map_err(|e| e.to_string())?
            {
                pods.push(pod);
            }
        }
        let resident: Vec<String> = pods
            .iter()
            .filter(|p| p.state.is_resident())
            .map(PodInfo::pod_id)
            .collect();
        if !resident.is_empty() {
            self.operator
                .stop(&resident)
                .await
                .map_err(|e| format!("stop failed: {e}"))?;
        }
        for pod in &mut pods {
            pod.state = PodState::Killed;
            pod.host = None;
            self.persist(pod)?;
        }
        debug!(job = %job_id, stopped = resident.len(), "instances stopped");
        Ok(resident.len())
    }

    /// Record `spec` on an instance without launching it.
    pub fn stage(
        &self,
        job_id: &str,
        instance_id: u32,
        spec: PodSpec,
        spec_version: u64,
    ) -> StateResult<()> {
        let mut pod = self
            .store
            .get_pod(job_id, instance_id)?
            .unwrap_or_else(|| fresh_pod(job_id, instance_id, spec.clone(), spec_version));
        pod.spec = spec;
        pod.spec_version = spec_version;
        pod.attempts = 0;
        if !pod.state.is_resident() {
            pod.state = PodState::Killed;
            pod.host = None;
        }
        pod.updated_at = epoch_millis();
        self.store.put_pod(&pod)?;
        debug!(job = %job_id, instance = instance_id, spec_version, "instance staged");
        Ok(())
    }

    async fn kill_if_resident(&self, pod: &PodInfo) {
        if !pod.state.is_resident() {
            return;
        }
        if let Err(e) = self.operator.kill(&[pod.pod_id()]).await {
            warn!(pod = %pod.pod_id(), error = %e, "failed to kill previous run");
        }
    }

    fn persist(&self, pod: &mut PodInfo) -> Result<(), String> {
        pod.updated_at = epoch_millis();
        self.store
            .put_pod(pod)
            .map_err(|e| format!("failed to record pod: {e}"))
    }
}

/// A pod record for an instance that never ran.
pub fn fresh_pod(job_id: &str, instance_id: u32, spec: PodSpec, spec_version: u64) -> PodInfo {
    PodInfo {
        job_id: job_id.to_string(),
        instance_id,
        run_id: 0,
        spec_version,
        spec,
        state: PodState::Initialized,
        host: None,
        attempts: 0,
        failure_reason: None,
        updated_at: epoch_millis(),
    }
}
