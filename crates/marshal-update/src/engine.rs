//! Update engine — operator calls and the background driver loop.
//!
//! Operator calls (`create_update`, `pause`, `resume`, `abort`) are
//! single commits guarded by the job's entity version. Progress is made
//! by [`UpdateEngine::step`], which the run loop calls from one driver
//! task per active update. Steps on the same job are serialized; steps
//! on different jobs run independently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use marshal_core::{ConcurrentUpdatePolicy, MarshalConfig};
use marshal_runtime::{HealthEvaluator, TaskOperator};
use marshal_state::{
    epoch_millis, Commit, EntityVersion, HostState, Hostname, InstanceChange, JobGoal, JobId,
    JobRecord, JobSpec, PodInfo, PodSpec, PodState, StateError, StateStore, UpdateConfig,
    UpdateEntity, UpdateId, UpdateState,
};

use crate::diff::{actionable, diff_pods};
use crate::error::{UpdateError, UpdateResult};
use crate::executor::{fresh_pod, BatchExecutor, ExecutorSettings};
use crate::machine::{self, Verdict};
use crate::version;

/// Attempts at an operator commit that keeps losing to the driver.
const MAX_COMMIT_RETRIES: usize = 8;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub poll_interval: Duration,
    pub health_poll_interval: Duration,
    pub instance_timeout: Duration,
    /// Used when an update asks for `max_instance_attempts = 0`.
    pub default_max_instance_attempts: u32,
    pub concurrent_update_policy: ConcurrentUpdatePolicy,
}

impl EngineSettings {
    pub fn from_config(config: &MarshalConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            health_poll_interval: config.health_poll_interval(),
            instance_timeout: config.instance_timeout(),
            default_max_instance_attempts: config.default_max_instance_attempts(),
            concurrent_update_policy: config.concurrent_update_policy(),
        }
    }

    pub fn executor_settings(&self, config: &UpdateConfig) -> ExecutorSettings {
        ExecutorSettings {
            max_attempts: if config.max_instance_attempts == 0 {
                self.default_max_instance_attempts
            } else {
                config.max_instance_attempts
            },
            instance_timeout: self.instance_timeout,
            health_poll_interval: self.health_poll_interval,
            in_place: config.in_place,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&MarshalConfig::default())
    }
}

/// Whether a step moved the update forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Something was committed; step again.
    Progressed,
    /// Nothing to do until an operator or another update acts.
    Idle,
}

#[derive(Clone)]
pub struct UpdateEngine {
    store: StateStore,
    executor: BatchExecutor,
    settings: EngineSettings,
    /// Active driver tasks: update_id → handle.
    drivers: Arc<RwLock<HashMap<UpdateId, JoinHandle<()>>>>,
    /// One lock per job so steps on a job never overlap.
    job_locks: Arc<Mutex<HashMap<JobId, Arc<Mutex<()>>>>>,
}

impl UpdateEngine {
    pub fn new(
        store: StateStore,
        operator: Arc<dyn TaskOperator>,
        health: Arc<dyn HealthEvaluator>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            executor: BatchExecutor::new(store.clone(), operator, health),
            store,
            settings,
            drivers: Arc::new(RwLock::new(HashMap::new())),
            job_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    // ── Operator calls ─────────────────────────────────────────────

    /// Record a new update moving `job_id` to `target`.
    ///
    /// Returns the update id and the job's new entity version.
    pub fn create_update(
        &self,
        job_id: &str,
        target: JobSpec,
        entity_version: &str,
        config: UpdateConfig,
    ) -> UpdateResult<(UpdateId, EntityVersion)> {
        version::validate_spec(&target)?;
        let presented = version::parse(entity_version)?;
        let job = self.load_job(job_id)?;
        version::check(&job, presented)?;

        let active = self.active_updates(job_id)?;
        let policy = self.settings.concurrent_update_policy;
        if policy == ConcurrentUpdatePolicy::Reject {
            if let Some(existing) = active.first() {
                return Err(UpdateError::InvalidState(format!(
                    "job {job_id} already has active update {}",
                    existing.id
                )));
            }
        }

        let now = epoch_millis();
        let target_version = job.config_version + 1;
        let next_job = version::with_config(&job, target_version, now);
        let update = machine::new_update(
            &job.id,
            job.config_version,
            target_version,
            config,
            next_job.workflow_version,
            now,
        );

        let mut commit = Commit::new()
            .put_job(next_job.clone(), presented)
            .put_config(job_id, target_version, target)
            .put_update(update.clone());
        if policy == ConcurrentUpdatePolicy::Supersede {
            for mut old in active {
                machine::abort(&mut old, Some(format!("superseded by {}", update.id)), now)?;
                commit = commit.put_update(old);
            }
        }
        self.store.commit(commit)?;

        info!(
            job = %job_id,
            update = %update.id,
            from = job.config_version,
            to = target_version,
            state = %update.state,
            "update created"
        );
        Ok((update.id, next_job.entity_version()))
    }

    pub fn pause(&self, update_id: &str, entity_version: &str) -> UpdateResult<EntityVersion> {
        self.operate(update_id, entity_version, |update, now| {
            machine::pause(update, now)
        })
    }

    pub fn resume(&self, update_id: &str, entity_version: &str) -> UpdateResult<EntityVersion> {
        self.operate(update_id, entity_version, |update, now| {
            let must_wait = self.has_older_active(update)?;
            machine::resume(update, must_wait, now)
        })
    }

    pub fn abort(&self, update_id: &str, entity_version: &str) -> UpdateResult<EntityVersion> {
        self.operate(update_id, entity_version, |update, now| {
            machine::abort(update, None, now)
        })
    }

    pub fn get_update(&self, update_id: &str) -> UpdateResult<UpdateEntity> {
        self.load_update(update_id)
    }

    /// Updates of one job oldest first, or every update.
    pub fn list_updates(&self, job_id: Option<&str>) -> UpdateResult<Vec<UpdateEntity>> {
        Ok(match job_id {
            Some(job_id) => self.store.list_updates_for_job(job_id)?,
            None => self.store.list_updates()?,
        })
    }

    /// Apply an operator transition, re-validating the entity version on
    /// every try. Retries only when the driver wrote the update in between.
    fn operate<F>(
        &self,
        update_id: &str,
        entity_version: &str,
        mut apply: F,
    ) -> UpdateResult<EntityVersion>
    where
        F: FnMut(&mut UpdateEntity, u64) -> UpdateResult<()>,
    {
        let presented = version::parse(entity_version)?;
        for _ in 0..MAX_COMMIT_RETRIES {
            let mut update = self.load_update(update_id)?;
            let job = self.load_job(&update.job_id)?;
            version::check(&job, presented)?;

            let now = epoch_millis();
            apply(&mut update, now)?;
            let next_job = version::with_workflow_bump(&job, now);
            let commit = Commit::new()
                .put_job(next_job.clone(), presented)
                .put_update(update);
            match self.store.commit(commit) {
                Ok(()) => return Ok(next_job.entity_version()),
                Err(StateError::Conflict(reason)) => {
                    debug!(update = %update_id, %reason, "operator commit lost a race, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(UpdateError::Conflict(format!(
            "update {update_id} kept changing, try again"
        )))
    }

    // ── Driving ────────────────────────────────────────────────────

    /// Advance one update by one unit of work: plan, one wave, or a
    /// terminal transition.
    pub async fn step(&self, update_id: &str) -> UpdateResult<StepOutcome> {
        let job_id = self.load_update(update_id)?.job_id;
        let lock = self.job_lock(&job_id).await;
        let _guard = lock.lock().await;

        let mut update = self.load_update(update_id)?;
        if update.state.is_terminal() || update.state == UpdateState::Paused {
            return Ok(StepOutcome::Idle);
        }

        let Some(job) = self.store.get_job(&job_id)? else {
            return self.fail_update(update, format!("job {job_id} no longer exists"));
        };
        let Some(target) = self
            .store
            .get_job_config(&job_id, update.target_spec_version)?
        else {
            let reason = format!("config version {} is missing", update.target_spec_version);
            return self.fail_update(update, reason);
        };

        let now = epoch_millis();
        if !update.planned {
            if self.has_older_active(&update)? {
                debug!(update = %update_id, job = %job_id, "waiting for older updates");
                return Ok(StepOutcome::Idle);
            }
            let pods = self.store.list_pods_for_job(&job_id)?;
            let plan = actionable(diff_pods(&pods, &target, job.goal == JobGoal::Running));
            machine::begin(&mut update, plan, now);
            return self.commit_step(Commit::new().put_update(update));
        }

        if job.goal == JobGoal::Killed {
            info!(update = %update_id, job = %job_id, "job is stopped, staging remaining instances");
            for planned in &update.plan {
                if update.instances_done.contains(&planned.instance_id) {
                    continue;
                }
                if matches!(
                    planned.change,
                    InstanceChange::Added | InstanceChange::Modified
                ) {
                    self.executor.stage(
                        &job_id,
                        planned.instance_id,
                        target.effective_spec(planned.instance_id),
                        update.target_spec_version,
                    )?;
                }
            }
            return self.complete(update, &target, now);
        }

        match machine::evaluate(&update) {
            Verdict::Fail(reason) => self.fail_update(update, reason),
            Verdict::RollBack(reason) => self.start_rollback(update, &job, reason, now),
            Verdict::Complete => self.complete(update, &target, now),
            Verdict::Continue => {
                let wave_index = update.waves_completed;
                let Some(wave) = machine::next_wave(&update) else {
                    return self.complete(update, &target, now);
                };
                info!(
                    update = %update_id,
                    job = %job_id,
                    wave = wave_index + 1,
                    of = machine::total_waves(&update),
                    instances = wave.len(),
                    rollback = update.rollback,
                    "dispatching wave"
                );
                let settings = self.settings.executor_settings(&update.config);
                let outcome = self
                    .executor
                    .run_wave(&job_id, &target, update.target_spec_version, &wave, &settings)
                    .await;
                self.record_progress(update_id, wave_index, &outcome)?;
                Ok(StepOutcome::Progressed)
            }
        }
    }

    /// Step an update until it goes idle; returns its state then.
    pub async fn drive(&self, update_id: &str) -> UpdateResult<UpdateState> {
        while self.step(update_id).await? == StepOutcome::Progressed {}
        Ok(self.load_update(update_id)?.state)
    }

    /// Store a wave's outcome on the latest revision of the update.
    /// Progress of an update that went terminal mid-wave is dropped.
    fn record_progress(
        &self,
        update_id: &str,
        wave_index: u32,
        outcome: &machine::WaveOutcome,
    ) -> UpdateResult<()> {
        for _ in 0..MAX_COMMIT_RETRIES {
            let mut update = self.load_update(update_id)?;
            if update.state.is_terminal() {
                debug!(update = %update_id, state = %update.state, "update ended mid-wave");
                return Ok(());
            }
            machine::record_wave(&mut update, wave_index, outcome);
            match self.store.commit(Commit::new().put_update(update)) {
                Ok(()) => {
                    debug!(
                        update = %update_id,
                        wave = wave_index + 1,
                        converged = outcome.converged.len(),
                        failed = outcome.failed.len(),
                        "wave recorded"
                    );
                    return Ok(());
                }
                Err(StateError::Conflict(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(UpdateError::Conflict(format!(
            "could not record wave {} of update {update_id}",
            wave_index + 1
        )))
    }

    /// Reconcile pod records with the target spec and finish the update.
    fn complete(
        &self,
        mut update: UpdateEntity,
        target: &JobSpec,
        now: u64,
    ) -> UpdateResult<StepOutcome> {
        let pods = self.store.list_pods_for_job(&update.job_id)?;
        let mut commit = Commit::new();
        for pod in &pods {
            if pod.instance_id >= target.instance_count {
                commit = commit.remove_pod(&pod.job_id, pod.instance_id);
            }
        }
        for instance_id in 0..target.instance_count {
            if !pods.iter().any(|p| p.instance_id == instance_id) {
                let mut pod = fresh_pod(
                    &update.job_id,
                    instance_id,
                    target.effective_spec(instance_id),
                    update.target_spec_version,
                );
                pod.state = PodState::Killed;
                commit = commit.put_pod(pod);
            }
        }
        machine::finish(&mut update, now);
        self.commit_step(commit.put_update(update))
    }

    fn fail_update(&self, mut update: UpdateEntity, reason: String) -> UpdateResult<StepOutcome> {
        machine::fail(&mut update, reason, epoch_millis());
        self.commit_step(Commit::new().put_update(update))
    }

    /// Store a copy of the pre-update spec as a new version and plan the
    /// way back to it.
    fn start_rollback(
        &self,
        mut update: UpdateEntity,
        job: &JobRecord,
        reason: String,
        now: u64,
    ) -> UpdateResult<StepOutcome> {
        let Some(previous) = self
            .store
            .get_job_config(&job.id, update.prev_spec_version)?
        else {
            let reason = format!(
                "{reason}; cannot roll back, config version {} is missing",
                update.prev_spec_version
            );
            return self.fail_update(update, reason);
        };

        let rollback_version = job.config_version + 1;
        let pods = self.store.list_pods_for_job(&job.id)?;
        let plan = actionable(diff_pods(&pods, &previous, job.goal == JobGoal::Running));
        machine::start_rollback(&mut update, rollback_version, plan, reason, now);

        let commit = Commit::new()
            .put_job(
                version::with_config(job, rollback_version, now),
                job.entity_version(),
            )
            .put_config(&job.id, rollback_version, previous)
            .put_update(update);
        self.commit_step(commit)
    }

    /// Commit a driver transition. Losing a race is not an error: the
    /// next step re-reads and decides again.
    fn commit_step(&self, commit: Commit) -> UpdateResult<StepOutcome> {
        match self.store.commit(commit) {
            Ok(()) => Ok(StepOutcome::Progressed),
            Err(e) if e.is_conflict() => {
                debug!(error = %e, "driver commit lost a race");
                Ok(StepOutcome::Progressed)
            }
            Err(e) => Err(e.into()),
        }
    }

    // ── Background loop ────────────────────────────────────────────

    /// Spawn a driver for every runnable update each `poll_interval`
    /// until `shutdown` fires.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            policy = ?self.settings.concurrent_update_policy,
            "update engine started"
        );
        let driver_shutdown = shutdown.clone();
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.spawn_drivers(&driver_shutdown).await {
                        error!(error = %e, "failed to scan updates");
                    }
                    if let Err(e) = self.reconcile_pending().await {
                        error!(error = %e, "failed to reconcile pending pods");
                    }
                }
                _ = shutdown.changed() => {
                    info!("update engine shutting down");
                    break;
                }
            }
        }
        self.stop_all().await;
    }

    async fn spawn_drivers(&self, shutdown: &watch::Receiver<bool>) -> UpdateResult<()> {
        let runnable: Vec<UpdateEntity> = self
            .store
            .list_updates()?
            .into_iter()
            .filter(|u| !u.state.is_terminal() && u.state != UpdateState::Paused)
            .collect();

        let mut drivers = self.drivers.write().await;
        drivers.retain(|_, handle| !handle.is_finished());
        for update in runnable {
            if drivers.contains_key(&update.id) {
                continue;
            }
            let engine = self.clone();
            let update_id = update.id.clone();
            let shutdown = shutdown.clone();
            let handle = tokio::spawn(async move {
                engine.run_driver(&update_id, shutdown).await;
            });
            debug!(update = %update.id, job = %update.job_id, "driver started");
            drivers.insert(update.id, handle);
        }
        Ok(())
    }

    /// Step one update until idle. Shutdown is honoured between steps only.
    async fn run_driver(&self, update_id: &str, shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.step(update_id).await {
                Ok(StepOutcome::Progressed) => continue,
                Ok(StepOutcome::Idle) => break,
                Err(e) => {
                    error!(update = %update_id, error = %e, code = %e.code(), "update step failed");
                    if let Err(record_err) = self.note_step_failure(update_id, &e) {
                        warn!(update = %update_id, error = %record_err, "could not record step failure");
                    }
                    break;
                }
            }
        }
    }

    /// Keep the reason a step failed on the update. Transient store errors
    /// are only logged; the next tick retries.
    fn note_step_failure(&self, update_id: &str, err: &UpdateError) -> UpdateResult<()> {
        if err.is_transient() {
            return Ok(());
        }
        let mut update = self.load_update(update_id)?;
        if update.state.is_terminal() {
            return Ok(());
        }
        update.failure_reason = Some(format!("step failed: {err}"));
        self.store.commit(Commit::new().put_update(update))?;
        Ok(())
    }

    /// Relaunch `Pending` pods of running jobs once a host can take them.
    ///
    /// Pods land in `Pending` when a drain evicts them or no host fits.
    /// Pinned pods stay there until their host is back up. Jobs with an
    /// active update are left to it. Returns `(job, instance)` of every pod
    /// that came back.
    pub async fn reconcile_pending(&self) -> UpdateResult<Vec<(JobId, u32)>> {
        let up: Vec<Hostname> = self
            .store
            .list_hosts()?
            .into_iter()
            .filter(|h| h.state == HostState::Up)
            .map(|h| h.hostname)
            .collect();
        let settings = self.settings.executor_settings(&UpdateConfig::default());
        let mut relaunched = Vec::new();

        for job in self.store.list_jobs()? {
            if job.goal != JobGoal::Running || !self.active_updates(&job.id)?.is_empty() {
                continue;
            }
            let lock = self.job_lock(&job.id).await;
            let _guard = lock.lock().await;

            let stranded: Vec<PodInfo> = self
                .store
                .list_pods_for_job(&job.id)?
                .into_iter()
                .filter(|p| p.state == PodState::Pending && placeable(&p.spec, &up))
                .collect();
            if stranded.is_empty() {
                continue;
            }
            debug!(job = %job.id, pods = stranded.len(), "relaunching pending pods");

            let results = join_all(stranded.iter().map(|pod| {
                self.executor.converge(
                    &job.id,
                    pod.instance_id,
                    pod.spec.clone(),
                    pod.spec_version,
                    &settings,
                )
            }))
            .await;
            for (pod, result) in stranded.iter().zip(results) {
                match result {
                    Ok(()) => relaunched.push((job.id.clone(), pod.instance_id)),
                    Err(reason) => {
                        warn!(job = %job.id, instance = pod.instance_id, %reason, "pending pod not relaunched")
                    }
                }
            }
        }
        if !relaunched.is_empty() {
            info!(pods = relaunched.len(), "pending pods relaunched");
        }
        Ok(relaunched)
    }

    /// Wait for running drivers to finish their current step.
    pub async fn stop_all(&self) {
        let handles: Vec<(UpdateId, JoinHandle<()>)> =
            self.drivers.write().await.drain().collect();
        for (update_id, handle) in handles {
            if let Err(e) = handle.await {
                warn!(update = %update_id, error = %e, "driver task ended abnormally");
            }
        }
        info!("all update drivers stopped");
    }

    /// Update ids with a live driver task.
    pub async fn active_drivers(&self) -> Vec<UpdateId> {
        let drivers = self.drivers.read().await;
        drivers
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .map(|(id, _)| id.clone())
            .collect()
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn load_job(&self, job_id: &str) -> UpdateResult<JobRecord> {
        self.store
            .get_job(job_id)?
            .ok_or_else(|| UpdateError::NotFound(format!("job {job_id}")))
    }

    fn load_update(&self, update_id: &str) -> UpdateResult<UpdateEntity> {
        self.store
            .get_update(update_id)?
            .ok_or_else(|| UpdateError::NotFound(format!("update {update_id}")))
    }

    fn active_updates(&self, job_id: &str) -> UpdateResult<Vec<UpdateEntity>> {
        Ok(self
            .store
            .list_updates_for_job(job_id)?
            .into_iter()
            .filter(|u| !u.state.is_terminal())
            .collect())
    }

    /// Whether an older update on the same job is still active.
    fn has_older_active(&self, update: &UpdateEntity) -> UpdateResult<bool> {
        Ok(self
            .active_updates(&update.job_id)?
            .iter()
            .any(|u| u.id != update.id && u.created_seq < update.created_seq))
    }

    async fn job_lock(&self, job_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.job_locks.lock().await;
        locks.entry(job_id.to_string()).or_default().clone()
    }
}

/// Whether some `UP` host satisfies the pod's placement.
fn placeable(spec: &PodSpec, up: &[Hostname]) -> bool {
    match &spec.constraint {
        Some(constraint) => up.contains(&constraint.hostname),
        None => !up.is_empty(),
    }
}
