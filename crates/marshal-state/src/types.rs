//! Domain types for the Marshal state store.
//!
//! These types represent the persisted state of jobs, pods, updates and
//! hosts. All types are serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Unique identifier for a job.
pub type JobId = String;

/// Unique identifier for an update.
pub type UpdateId = String;

/// Hostname of a cluster host.
pub type Hostname = String;

// ── Job spec ──────────────────────────────────────────────────────

/// Versioned specification of a stateless job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobSpec {
    pub name: String,
    pub instance_count: u32,
    /// Spec used by every instance without an override.
    pub default_spec: PodSpec,
    /// Per-instance overrides, keyed by instance index.
    #[serde(default)]
    pub instance_spec: BTreeMap<u32, PodSpec>,
    /// Job-wide placement constraint, applied to pods that carry none.
    #[serde(default)]
    pub constraint: Option<HostConstraint>,
}

/// Specification of one pod.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PodSpec {
    pub containers: Vec<ContainerSpec>,
    #[serde(default)]
    pub constraint: Option<HostConstraint>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,
}

/// Command-based health check for a container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthCheckSpec {
    pub enabled: bool,
    pub command: String,
    pub initial_interval_secs: u32,
    pub interval_secs: u32,
    /// Consecutive failures before the container is unhealthy.
    pub max_consecutive_failures: u32,
    pub timeout_secs: u32,
}

/// Hard host-affinity: the pod may only run on `hostname`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostConstraint {
    pub hostname: Hostname,
}

impl JobSpec {
    /// Effective spec for an instance: its override if any, else the
    /// default spec, with the job constraint merged in.
    pub fn effective_spec(&self, instance_id: u32) -> PodSpec {
        let mut spec = self
            .instance_spec
            .get(&instance_id)
            .cloned()
            .unwrap_or_else(|| self.default_spec.clone());
        if spec.constraint.is_none() {
            spec.constraint = self.constraint.clone();
        }
        spec
    }
}

impl PodSpec {
    /// The first enabled health check across the containers.
    pub fn health_check(&self) -> Option<&HealthCheckSpec> {
        self.containers
            .iter()
            .filter_map(|c| c.health_check.as_ref())
            .find(|h| h.enabled)
    }
}

// ── Entity version ────────────────────────────────────────────────

/// Optimistic concurrency token of a job, rendered `config-desired_state-workflow`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityVersion {
    pub config: u64,
    pub desired_state: u64,
    pub workflow: u64,
}

impl fmt::Display for EntityVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.config, self.desired_state, self.workflow)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEntityVersionError(pub String);

impl fmt::Display for ParseEntityVersionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed entity version {:?}", self.0)
    }
}

impl std::error::Error for ParseEntityVersionError {}

impl FromStr for EntityVersion {
    type Err = ParseEntityVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseEntityVersionError(s.to_string());
        let mut parts = s.trim().split('-');
        let mut next = || -> Result<u64, ParseEntityVersionError> {
            parts.next().ok_or_else(err)?.parse::<u64>().map_err(|_| err())
        };
        let version = EntityVersion {
            config: next()?,
            desired_state: next()?,
            workflow: next()?,
        };
        if parts.next().is_some() {
            return Err(err());
        }
        Ok(version)
    }
}

// ── Job ───────────────────────────────────────────────────────────

/// What the operator wants the job to be doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobGoal {
    Running,
    Killed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Initialized,
    Running,
    Killed,
}

/// Runtime record of a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobRecord {
    pub id: JobId,
    /// Version of the job spec currently in force.
    pub config_version: u64,
    pub desired_state_version: u64,
    pub workflow_version: u64,
    pub goal: JobGoal,
    pub state: JobState,
    pub created_at: u64,
    pub updated_at: u64,
}

impl JobRecord {
    pub fn entity_version(&self) -> EntityVersion {
        EntityVersion {
            config: self.config_version,
            desired_state: self.desired_state_version,
            workflow: self.workflow_version,
        }
    }
}

// ── Pod ───────────────────────────────────────────────────────────

/// Lifecycle state of a single pod run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PodState {
    Initialized,
    Pending,
    Launched,
    Starting,
    Running,
    Failed,
    Killing,
    Killed,
}

impl PodState {
    /// Failed and killed runs are finished; the pod needs a new run to do anything.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PodState::Failed | PodState::Killed)
    }

    /// Whether a run in this state occupies a host.
    pub fn is_resident(&self) -> bool {
        matches!(
            self,
            PodState::Launched | PodState::Starting | PodState::Running | PodState::Killing
        )
    }
}

/// Record of one job instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PodInfo {
    pub job_id: JobId,
    pub instance_id: u32,
    /// Incremented on every relaunch; part of the pod id.
    pub run_id: u64,
    /// Job config version this pod's spec came from.
    pub spec_version: u64,
    /// Effective spec of this instance.
    pub spec: PodSpec,
    pub state: PodState,
    pub host: Option<Hostname>,
    /// Launch attempts made for the current spec.
    pub attempts: u32,
    pub failure_reason: Option<String>,
    pub updated_at: u64,
}

impl PodInfo {
    /// Versioned pod id: `{job_id}-{instance_id}-{run_id}`.
    pub fn pod_id(&self) -> String {
        format!("{}-{}-{}", self.job_id, self.instance_id, self.run_id)
    }

    /// Build the composite key for the pods table.
    pub fn table_key(&self) -> String {
        pod_key(&self.job_id, self.instance_id)
    }
}

pub fn pod_key(job_id: &str, instance_id: u32) -> String {
    format!("{job_id}:{instance_id:06}")
}

pub fn job_config_key(job_id: &str, version: u64) -> String {
    format!("{job_id}:{version:020}")
}

// ── Update ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateState {
    Initialized,
    RollingForward,
    Paused,
    Succeeded,
    Failed,
    RolledBack,
    Aborted,
}

impl UpdateState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UpdateState::Succeeded
                | UpdateState::Failed
                | UpdateState::RolledBack
                | UpdateState::Aborted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateState::Initialized => "INITIALIZED",
            UpdateState::RollingForward => "ROLLING_FORWARD",
            UpdateState::Paused => "PAUSED",
            UpdateState::Succeeded => "SUCCEEDED",
            UpdateState::Failed => "FAILED",
            UpdateState::RolledBack => "ROLLED_BACK",
            UpdateState::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator-supplied knobs for one update.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateConfig {
    /// Instances per wave; 0 means one wave with every instance.
    pub batch_size: u32,
    /// Failed instances that end the update; 0 means no limit.
    pub max_failure_instances: u32,
    /// Launch attempts per instance; 0 means the engine default.
    pub max_instance_attempts: u32,
    pub roll_back_on_failure: bool,
    pub start_paused: bool,
    /// Prefer each pod's current host when relaunching.
    pub in_place: bool,
}

/// How an instance differs between two job generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceChange {
    Unchanged,
    Modified,
    Added,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedInstance {
    pub instance_id: u32,
    pub change: InstanceChange,
}

/// A request to move a job from one spec version to another.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateEntity {
    pub id: UpdateId,
    pub job_id: JobId,
    pub prev_spec_version: u64,
    pub target_spec_version: u64,
    pub state: UpdateState,
    /// State to return to on resume.
    pub paused_from: Option<UpdateState>,
    pub config: UpdateConfig,
    /// True once the update is driving back to `prev_spec_version`.
    pub rollback: bool,
    /// Instances that need work, in index order. Empty until planned.
    pub plan: Vec<PlannedInstance>,
    pub planned: bool,
    pub waves_completed: u32,
    pub instances_done: Vec<u32>,
    pub instances_failed: Vec<u32>,
    pub failure_reason: Option<String>,
    /// Job workflow version at creation; orders updates of one job.
    pub created_seq: u64,
    /// Bumped by the store on every write; guards concurrent writers.
    pub revision: u64,
    pub created_at: u64,
    pub last_transition_at: u64,
}

impl UpdateEntity {
    pub fn instances_of(&self, change: InstanceChange) -> Vec<u32> {
        self.plan
            .iter()
            .filter(|p| p.change == change)
            .map(|p| p.instance_id)
            .collect()
    }
}

// ── Host ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostState {
    Up,
    Draining,
    Down,
}

impl HostState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostState::Up => "UP",
            HostState::Draining => "DRAINING",
            HostState::Down => "DOWN",
        }
    }
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HostState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().trim_start_matches("HOST_STATE_") {
            "UP" => Ok(HostState::Up),
            "DRAINING" => Ok(HostState::Draining),
            "DOWN" => Ok(HostState::Down),
            other => Err(format!("unknown host state: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostEntity {
    pub hostname: Hostname,
    pub state: HostState,
    pub maintenance_request_time: Option<u64>,
    pub last_transition_at: u64,
}
