//! Drain coordinator — host maintenance state machine and its poll loop.
//!
//! Operator calls are single commits guarded by the stored host state.
//! `run_cycle` works through the persisted maintenance queue: it kills
//! the pods resident on each queued host, records them as `Pending`, and
//! moves the host to `DOWN` once nothing is left on it. A host that still
//! has residents stays queued for the next cycle.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use marshal_runtime::TaskOperator;
use marshal_state::{
    epoch_millis, Commit, HostEntity, HostState, Hostname, PodInfo, PodState, StateStore,
};

use crate::error::{DrainError, DrainResult};

/// What one drain cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Hosts moved to `DOWN` this cycle.
    pub downed: Vec<Hostname>,
    /// Pods killed and set back to `Pending`.
    pub evicted: Vec<String>,
    /// Hosts still queued because residents remain.
    pub pending: Vec<Hostname>,
    /// Per-host failures; the cycle carried on past them.
    pub errors: Vec<(Hostname, String)>,
}

/// What `recover` changed in the maintenance queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainRecovery {
    pub requeued: Vec<Hostname>,
    pub dropped: Vec<Hostname>,
}

#[derive(Clone)]
pub struct DrainCoordinator {
    store: StateStore,
    operator: Arc<dyn TaskOperator>,
    draining_period: Duration,
}

impl DrainCoordinator {
    pub fn new(store: StateStore, operator: Arc<dyn TaskOperator>, draining_period: Duration) -> Self {
        Self {
            store,
            operator,
            draining_period,
        }
    }

    pub fn draining_period(&self) -> Duration {
        self.draining_period
    }

    /// Add a host in `UP`. A host that is already known is returned as is.
    pub fn register_host(&self, hostname: &str) -> DrainResult<HostEntity> {
        if hostname.trim().is_empty() {
            return Err(DrainError::InvalidArgument("hostname is empty".to_string()));
        }
        if let Some(existing) = self.store.get_host(hostname)? {
            return Ok(existing);
        }
        let host = HostEntity {
            hostname: hostname.to_string(),
            state: HostState::Up,
            maintenance_request_time: None,
            last_transition_at: epoch_millis(),
        };
        self.store.commit(Commit::new().upsert_host(host.clone()))?;
        info!(host = %hostname, "host registered");
        Ok(host)
    }

    /// Move every host in `hostnames` from `UP` to `DRAINING` and queue it.
    ///
    /// All hosts must be `UP`; if any is not, nothing changes.
    pub fn start_maintenance(&self, hostnames: &[String]) -> DrainResult<()> {
        let hosts = self.load_all(hostnames, HostState::Up)?;
        let now = epoch_millis();
        let mut commit = Commit::new();
        for host in hosts {
            let hostname = host.hostname.clone();
            commit = commit
                .put_host(
                    HostEntity {
                        state: HostState::Draining,
                        maintenance_request_time: Some(now),
                        last_transition_at: now,
                        ..host
                    },
                    HostState::Up,
                )
                .enqueue_host(&hostname, now);
        }
        self.store.commit(commit)?;
        info!(hosts = ?hostnames, "maintenance started");
        Ok(())
    }

    /// Bring `DOWN` hosts back to `UP` and clear their queue entries.
    pub fn complete_maintenance(&self, hostnames: &[String]) -> DrainResult<()> {
        let hosts = self.load_all(hostnames, HostState::Down)?;
        let now = epoch_millis();
        let mut commit = Commit::new();
        for host in hosts {
            let hostname = host.hostname.clone();
            commit = commit
                .put_host(
                    HostEntity {
                        state: HostState::Up,
                        maintenance_request_time: None,
                        last_transition_at: now,
                        ..host
                    },
                    HostState::Down,
                )
                .dequeue_host(&hostname);
        }
        self.store.commit(commit)?;
        info!(hosts = ?hostnames, "maintenance completed");
        Ok(())
    }

    /// Hosts in any of `states`, or every host when `states` is empty.
    pub fn query_hosts(&self, states: &[HostState]) -> DrainResult<Vec<HostEntity>> {
        Ok(self
            .store
            .list_hosts()?
            .into_iter()
            .filter(|h| states.is_empty() || states.contains(&h.state))
            .collect())
    }

    /// Read each named host and require it to be in `required`.
    fn load_all(&self, hostnames: &[String], required: HostState) -> DrainResult<Vec<HostEntity>> {
        if hostnames.is_empty() {
            return Err(DrainError::InvalidArgument("no hosts given".to_string()));
        }
        let unique: BTreeSet<&String> = hostnames.iter().collect();
        let mut hosts = Vec::with_capacity(unique.len());
        for hostname in unique {
            let host = self
                .store
                .get_host(hostname)?
                .ok_or_else(|| DrainError::NotFound(format!("host {hostname}")))?;
            if host.state != required {
                return Err(DrainError::InvalidState(format!(
                    "host {hostname} is {}, expected {required}",
                    host.state
                )));
            }
            hosts.push(host);
        }
        Ok(hosts)
    }

    // ── Drain cycle ────────────────────────────────────────────────

    /// One draining period's work over the maintenance queue.
    pub async fn run_cycle(&self) -> DrainResult<CycleReport> {
        let mut report = CycleReport::default();
        for (hostname, _) in self.store.list_maintenance_queue()? {
            if let Err(e) = self.drain_host(&hostname, &mut report).await {
                warn!(host = %hostname, error = %e, "drain cycle failed for host");
                report.errors.push((hostname, e.to_string()));
            }
        }
        if !report.downed.is_empty() || !report.evicted.is_empty() {
            info!(
                downed = report.downed.len(),
                evicted = report.evicted.len(),
                pending = report.pending.len(),
                "drain cycle finished"
            );
        }
        Ok(report)
    }

    async fn drain_host(&self, hostname: &str, report: &mut CycleReport) -> DrainResult<()> {
        let host = match self.store.get_host(hostname)? {
            Some(host) if host.state == HostState::Draining => host,
            other => {
                debug!(host = %hostname, state = ?other.map(|h| h.state), "dropping stale queue entry");
                self.store.commit(Commit::new().dequeue_host(hostname))?;
                return Ok(());
            }
        };

        let residents = self.store.list_pods_on_host(hostname)?;
        if !residents.is_empty() {
            let ids: Vec<String> = residents.iter().map(PodInfo::pod_id).collect();
            debug!(host = %hostname, pods = ?ids, "killing resident pods");
            self.operator.kill(&ids).await?;
            for pod in &residents {
                if self.evict(pod, hostname)? {
                    report.evicted.push(pod.pod_id());
                }
            }
        }

        if !self.store.list_pods_on_host(hostname)?.is_empty() {
            report.pending.push(hostname.to_string());
            return Ok(());
        }

        let now = epoch_millis();
        self.store.commit(
            Commit::new()
                .put_host(
                    HostEntity {
                        state: HostState::Down,
                        last_transition_at: now,
                        ..host
                    },
                    HostState::Draining,
                )
                .dequeue_host(hostname),
        )?;
        info!(host = %hostname, "host drained, now DOWN");
        report.downed.push(hostname.to_string());
        Ok(())
    }

    /// Record a killed pod as `Pending` with no host, unless it has since
    /// been relaunched elsewhere.
    fn evict(&self, killed: &PodInfo, hostname: &str) -> DrainResult<bool> {
        let Some(mut pod) = self.store.get_pod(&killed.job_id, killed.instance_id)? else {
            return Ok(false);
        };
        if pod.run_id != killed.run_id || pod.host.as_deref() != Some(hostname) {
            debug!(pod = %killed.pod_id(), "pod moved on before eviction was recorded");
            return Ok(false);
        }
        pod.state = PodState::Pending;
        pod.host = None;
        pod.failure_reason = Some(format!("evicted from draining host {hostname}"));
        pod.updated_at = epoch_millis();
        self.store.put_pod(&pod)?;
        Ok(true)
    }

    /// Run drain cycles every draining period until `shutdown` fires.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            draining_period_ms = self.draining_period.as_millis() as u64,
            "drain coordinator started"
        );
        let mut ticker = tokio::time::interval(self.draining_period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        error!(error = %e, "failed to read maintenance queue");
                    }
                }
                _ = shutdown.changed() => {
                    info!("drain coordinator shutting down");
                    break;
                }
            }
        }
    }

    // ── Recovery ───────────────────────────────────────────────────

    /// Make the queue agree with host state after a restart: every
    /// `DRAINING` host is queued and nothing else is.
    pub fn recover(&self) -> DrainResult<DrainRecovery> {
        let mut recovery = DrainRecovery::default();
        let queued = self.store.list_maintenance_queue()?;
        let hosts = self.store.list_hosts()?;
        let mut commit = Commit::new();

        for host in hosts.iter().filter(|h| h.state == HostState::Draining) {
            if !queued.iter().any(|(name, _)| name == &host.hostname) {
                let at = host.maintenance_request_time.unwrap_or_else(epoch_millis);
                commit = commit.enqueue_host(&host.hostname, at);
                recovery.requeued.push(host.hostname.clone());
            }
        }
        for (name, _) in &queued {
            let draining = hosts
                .iter()
                .any(|h| &h.hostname == name && h.state == HostState::Draining);
            if !draining {
                commit = commit.dequeue_host(name);
                recovery.dropped.push(name.clone());
            }
        }

        if !commit.is_empty() {
            self.store.commit(commit)?;
        }
        let draining = hosts
            .iter()
            .filter(|h| h.state == HostState::Draining)
            .count();
        info!(
            draining,
            requeued = recovery.requeued.len(),
            dropped = recovery.dropped.len(),
            "maintenance queue recovered"
        );
        Ok(recovery)
    }
}
