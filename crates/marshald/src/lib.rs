//! marshald — assembles the Marshal control core.
//!
//! A [`Marshal`] owns the state store, the simulated cluster standing in
//! for the task operator, the job manager, the update engine and the
//! drain coordinator. `bootstrap` brings durable state back in line after
//! a restart; `run` drives both background loops until shutdown.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::info;

use marshal_core::MarshalConfig;
use marshal_drain::{DrainCoordinator, DrainRecovery};
use marshal_runtime::SimulatedCluster;
use marshal_state::StateStore;
use marshal_update::{recover_updates, EngineSettings, JobManager, RecoveryReport, UpdateEngine};

/// What `bootstrap` found and fixed.
#[derive(Debug, Clone, Default)]
pub struct BootReport {
    pub registered_hosts: usize,
    pub updates: RecoveryReport,
    pub drain: DrainRecovery,
}

#[derive(Clone)]
pub struct Marshal {
    pub store: StateStore,
    pub cluster: Arc<SimulatedCluster>,
    pub jobs: JobManager,
    pub updates: UpdateEngine,
    pub drain: DrainCoordinator,
}

impl Marshal {
    pub fn new(store: StateStore, config: &MarshalConfig) -> Self {
        Self::with_cluster(store.clone(), Arc::new(SimulatedCluster::new(store)), config)
    }

    /// Assemble around a preconfigured cluster, e.g. one with custom failure rules.
    pub fn with_cluster(
        store: StateStore,
        cluster: Arc<SimulatedCluster>,
        config: &MarshalConfig,
    ) -> Self {
        let settings = EngineSettings::from_config(config);
        let jobs = JobManager::new(store.clone(), cluster.clone(), cluster.clone(), &settings);
        let updates = UpdateEngine::new(store.clone(), cluster.clone(), cluster.clone(), settings);
        let drain = DrainCoordinator::new(store.clone(), cluster.clone(), config.draining_period());
        Self {
            store,
            cluster,
            jobs,
            updates,
            drain,
        }
    }

    /// Register `hosts`, fail orphaned updates and rebuild the maintenance queue.
    pub fn bootstrap(&self, hosts: &[String]) -> anyhow::Result<BootReport> {
        for host in hosts {
            self.drain
                .register_host(host)
                .with_context(|| format!("failed to register host {host}"))?;
        }
        let updates = recover_updates(&self.store).context("update recovery failed")?;
        let drain = self.drain.recover().context("maintenance queue recovery failed")?;
        info!(
            hosts = hosts.len(),
            resumed = updates.resumed.len(),
            failed = updates.failed.len(),
            requeued = drain.requeued.len(),
            "state recovered"
        );
        Ok(BootReport {
            registered_hosts: hosts.len(),
            updates,
            drain,
        })
    }

    /// Run the update engine and the drain loop until `shutdown` fires.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        let updates = self.updates.clone();
        let update_shutdown = shutdown.clone();
        let update_handle = tokio::spawn(async move {
            updates.run(update_shutdown).await;
        });

        let drain = self.drain.clone();
        let drain_handle = tokio::spawn(async move {
            drain.run(shutdown).await;
        });

        let _ = update_handle.await;
        let _ = drain_handle.await;
    }
}
