//! Traits for the external task placement engine and health source.

use async_trait::async_trait;

use marshal_state::{Hostname, JobId, PodSpec, PodState};

use crate::error::RuntimeResult;

/// Everything the placement engine needs to start one pod run.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub pod_id: String,
    pub job_id: JobId,
    pub instance_id: u32,
    pub spec: PodSpec,
    /// Preferred host, set for in-place updates. Only a hint.
    pub placement_hint: Option<Hostname>,
}

/// Where the run landed and what state it reached.
///
/// `Pending` with no host means nothing could satisfy the placement
/// constraints; `Failed` means the containers exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchResult {
    pub host: Option<Hostname>,
    pub state: PodState,
}

/// Places and stops pod runs.
#[async_trait]
pub trait TaskOperator: Send + Sync {
    async fn launch(&self, request: LaunchRequest) -> RuntimeResult<LaunchResult>;

    /// Gracefully stop runs. Unknown pod ids are ignored.
    async fn stop(&self, pod_ids: &[String]) -> RuntimeResult<()>;

    /// Kill runs immediately. Unknown pod ids are ignored.
    async fn kill(&self, pod_ids: &[String]) -> RuntimeResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    Pass,
    Fail,
    /// Not enough probes yet to decide.
    Pending,
}

/// Reports whether a launched pod run is healthy.
#[async_trait]
pub trait HealthEvaluator: Send + Sync {
    async fn evaluate(&self, pod_id: &str) -> RuntimeResult<HealthVerdict>;
}
