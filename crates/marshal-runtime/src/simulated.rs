//! In-memory cluster used by tests and the daemon's standalone mode.
//!
//! Places pods round-robin over `UP` hosts read from the state store and
//! keeps one [`HealthTracker`] per running pod, so health checks run on the
//! pod's own schedule no matter how often it is evaluated. Whether a
//! container or a health check "fails" is decided by a [`FailureRule`] on
//! its command.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use marshal_state::{HostState, Hostname, PodSpec, PodState, StateStore};

use crate::checker::{HealthStatus, HealthTracker};
use crate::error::RuntimeResult;
use crate::operator::{HealthEvaluator, HealthVerdict, LaunchRequest, LaunchResult, TaskOperator};

/// Decides from a command line whether running it fails.
pub type FailureRule = Arc<dyn Fn(&str) -> bool + Send + Sync>;

fn default_rule() -> FailureRule {
    Arc::new(|command: &str| command.contains("exit 1"))
}

struct SimTask {
    host: Hostname,
    /// `None` when the pod has no enabled health check.
    health: Option<(HealthTracker, bool)>,
}

#[derive(Default)]
struct ClusterInner {
    tasks: HashMap<String, SimTask>,
    next_host: usize,
    launches: u64,
}

pub struct SimulatedCluster {
    store: StateStore,
    inner: Mutex<ClusterInner>,
    container_rule: FailureRule,
    health_rule: FailureRule,
}

impl SimulatedCluster {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            inner: Mutex::new(ClusterInner::default()),
            container_rule: default_rule(),
            health_rule: default_rule(),
        }
    }

    /// Replace the rule deciding which container commands fail.
    pub fn with_container_rule(mut self, rule: FailureRule) -> Self {
        self.container_rule = rule;
        self
    }

    /// Replace the rule deciding which health-check commands fail.
    pub fn with_health_rule(mut self, rule: FailureRule) -> Self {
        self.health_rule = rule;
        self
    }

    /// Pod ids currently running, sorted.
    pub async fn running_pods(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut ids: Vec<String> = inner.tasks.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn host_of(&self, pod_id: &str) -> Option<Hostname> {
        let inner = self.inner.lock().await;
        inner.tasks.get(pod_id).map(|t| t.host.clone())
    }

    /// Total launch calls served, including failed ones.
    pub async fn launch_count(&self) -> u64 {
        self.inner.lock().await.launches
    }

    fn up_hosts(&self) -> RuntimeResult<Vec<Hostname>> {
        let mut hosts: Vec<Hostname> = self
            .store
            .list_hosts()?
            .into_iter()
            .filter(|h| h.state == HostState::Up)
            .map(|h| h.hostname)
            .collect();
        hosts.sort();
        Ok(hosts)
    }

    fn containers_fail(&self, spec: &PodSpec) -> bool {
        spec.containers.iter().any(|c| (self.container_rule)(&c.command))
    }

    fn health_for(&self, spec: &PodSpec) -> Option<(HealthTracker, bool)> {
        spec.health_check().map(|h| {
            (
                HealthTracker::new(h, Instant::now()),
                (self.health_rule)(&h.command),
            )
        })
    }
}

#[async_trait]
impl TaskOperator for SimulatedCluster {
    async fn launch(&self, request: LaunchRequest) -> RuntimeResult<LaunchResult> {
        let up = self.up_hosts()?;
        let mut inner = self.inner.lock().await;
        inner.launches += 1;

        let host = match &request.spec.constraint {
            Some(constraint) => up.iter().find(|h| **h == constraint.hostname).cloned(),
            None => match request.placement_hint.as_ref().filter(|h| up.contains(*h)) {
                Some(hint) => Some(hint.clone()),
                None if up.is_empty() => None,
                None => {
                    let host = up[inner.next_host % up.len()].clone();
                    inner.next_host += 1;
                    Some(host)
                }
            },
        };

        let Some(host) = host else {
            debug!(pod = %request.pod_id, "no host satisfies placement");
            return Ok(LaunchResult {
                host: None,
                state: PodState::Pending,
            });
        };

        if self.containers_fail(&request.spec) {
            info!(pod = %request.pod_id, %host, "simulated container exited");
            return Ok(LaunchResult {
                host: Some(host),
                state: PodState::Failed,
            });
        }

        let health = self.health_for(&request.spec);
        inner.tasks.insert(
            request.pod_id.clone(),
            SimTask {
                host: host.clone(),
                health,
            },
        );
        debug!(pod = %request.pod_id, %host, "simulated pod running");

        Ok(LaunchResult {
            host: Some(host),
            state: PodState::Running,
        })
    }

    async fn stop(&self, pod_ids: &[String]) -> RuntimeResult<()> {
        self.kill(pod_ids).await
    }

    async fn kill(&self, pod_ids: &[String]) -> RuntimeResult<()> {
        let mut inner = self.inner.lock().await;
        for id in pod_ids {
            if inner.tasks.remove(id).is_some() {
                debug!(pod = %id, "simulated pod killed");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl HealthEvaluator for SimulatedCluster {
    async fn evaluate(&self, pod_id: &str) -> RuntimeResult<HealthVerdict> {
        let mut inner = self.inner.lock().await;
        let Some(task) = inner.tasks.get_mut(pod_id) else {
            return Err(crate::RuntimeError::UnknownPod(pod_id.to_string()));
        };
        let Some((tracker, fails)) = task.health.as_mut() else {
            return Ok(HealthVerdict::Pass);
        };
        let now = Instant::now();
        let status = if tracker.is_due(now) {
            tracker.record(!*fails, now)
        } else {
            tracker.status()
        };
        Ok(match status {
            HealthStatus::Healthy => HealthVerdict::Pass,
            HealthStatus::Unhealthy => HealthVerdict::Fail,
            HealthStatus::Unknown => HealthVerdict::Pending,
        })
    }
}
