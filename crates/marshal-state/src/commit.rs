//! Atomic multi-record writes with optimistic preconditions.
//!
//! A [`Commit`] collects writes for one logical state transition. The
//! store applies it inside one redb write transaction, checking every
//! precondition first; if any fails nothing is written.

use crate::types::*;

/// Job write guarded by the entity version the caller read.
#[derive(Debug, Clone)]
pub(crate) struct JobWrite {
    pub record: JobRecord,
    /// `None` creates the job and requires that it does not exist yet.
    pub expected: Option<EntityVersion>,
}

/// Host write guarded by the state the caller read.
#[derive(Debug, Clone)]
pub(crate) struct HostWrite {
    pub host: HostEntity,
    pub expected: Option<HostState>,
}

/// A set of writes applied atomically by [`crate::StateStore::commit`].
#[derive(Debug, Clone, Default)]
pub struct Commit {
    pub(crate) jobs: Vec<JobWrite>,
    pub(crate) configs: Vec<(JobId, u64, JobSpec)>,
    pub(crate) pods: Vec<PodInfo>,
    pub(crate) removed_pods: Vec<(JobId, u32)>,
    pub(crate) updates: Vec<UpdateEntity>,
    pub(crate) hosts: Vec<HostWrite>,
    pub(crate) enqueue: Vec<(Hostname, u64)>,
    pub(crate) dequeue: Vec<Hostname>,
}

impl Commit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a job record, requiring the stored entity version to equal `expected`.
    pub fn put_job(mut self, record: JobRecord, expected: EntityVersion) -> Self {
        self.jobs.push(JobWrite {
            record,
            expected: Some(expected),
        });
        self
    }

    /// Insert a job record that must not exist yet.
    pub fn create_job(mut self, record: JobRecord) -> Self {
        self.jobs.push(JobWrite {
            record,
            expected: None,
        });
        self
    }

    /// Store an immutable job spec version. Rewriting an existing version is a conflict.
    pub fn put_config(mut self, job_id: &str, version: u64, spec: JobSpec) -> Self {
        self.configs.push((job_id.to_string(), version, spec));
        self
    }

    pub fn put_pod(mut self, pod: PodInfo) -> Self {
        self.pods.push(pod);
        self
    }

    pub fn remove_pod(mut self, job_id: &str, instance_id: u32) -> Self {
        self.removed_pods.push((job_id.to_string(), instance_id));
        self
    }

    /// Write an update. `update.revision` must match the stored revision
    /// (0 for a new update) and the stored update must not be terminal.
    pub fn put_update(mut self, update: UpdateEntity) -> Self {
        self.updates.push(update);
        self
    }

    /// Write a host, requiring its stored state to equal `expected`.
    pub fn put_host(mut self, host: HostEntity, expected: HostState) -> Self {
        self.hosts.push(HostWrite {
            host,
            expected: Some(expected),
        });
        self
    }

    /// Write a host unconditionally.
    pub fn upsert_host(mut self, host: HostEntity) -> Self {
        self.hosts.push(HostWrite {
            host,
            expected: None,
        });
        self
    }

    pub fn enqueue_host(mut self, hostname: &str, at: u64) -> Self {
        self.enqueue.push((hostname.to_string(), at));
        self
    }

    pub fn dequeue_host(mut self, hostname: &str) -> Self {
        self.dequeue.push(hostname.to_string());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
            && self.configs.is_empty()
            && self.pods.is_empty()
            && self.removed_pods.is_empty()
            && self.updates.is_empty()
            && self.hosts.is_empty()
            && self.enqueue.is_empty()
            && self.dequeue.is_empty()
    }
}
