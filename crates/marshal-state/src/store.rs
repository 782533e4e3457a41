//! StateStore — redb-backed state persistence for Marshal.
//!
//! Provides typed reads over jobs, job configs, pods, updates, hosts and
//! the maintenance queue, plus [`StateStore::commit`] for guarded
//! multi-record writes. All values are JSON-serialized into redb's
//! `&[u8]` value columns. The store supports both on-disk and in-memory
//! backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, Table, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::commit::Commit;
use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in [JOBS, JOB_CONFIGS, PODS, UPDATES, HOSTS, MAINTENANCE_QUEUE] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn read_one<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        get_json(&table, key)
    }

    /// All values whose key starts with `prefix`, in key order.
    fn read_prefix<T: DeserializeOwned>(&self, def: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let item: T =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(item);
            }
        }
        Ok(results)
    }

    // ── Jobs ───────────────────────────────────────────────────────

    pub fn get_job(&self, job_id: &str) -> StateResult<Option<JobRecord>> {
        self.read_one(JOBS, job_id)
    }

    pub fn list_jobs(&self) -> StateResult<Vec<JobRecord>> {
        self.read_prefix(JOBS, "")
    }

    /// Get one version of a job's spec.
    pub fn get_job_config(&self, job_id: &str, version: u64) -> StateResult<Option<JobSpec>> {
        self.read_one(JOB_CONFIGS, &job_config_key(job_id, version))
    }

    // ── Pods ───────────────────────────────────────────────────────

    pub fn get_pod(&self, job_id: &str, instance_id: u32) -> StateResult<Option<PodInfo>> {
        self.read_one(PODS, &pod_key(job_id, instance_id))
    }

    /// All pods of a job, ordered by instance index.
    pub fn list_pods_for_job(&self, job_id: &str) -> StateResult<Vec<PodInfo>> {
        self.read_prefix(PODS, &format!("{job_id}:"))
    }

    /// Pods whose current run occupies `hostname`.
    pub fn list_pods_on_host(&self, hostname: &str) -> StateResult<Vec<PodInfo>> {
        let pods: Vec<PodInfo> = self.read_prefix(PODS, "")?;
        Ok(pods
            .into_iter()
            .filter(|p| p.host.as_deref() == Some(hostname) && p.state.is_resident())
            .collect())
    }

    /// Insert or update a pod record without preconditions.
    pub fn put_pod(&self, pod: &PodInfo) -> StateResult<()> {
        self.commit(Commit::new().put_pod(pod.clone()))
    }

    // ── Updates ────────────────────────────────────────────────────

    pub fn get_update(&self, update_id: &str) -> StateResult<Option<UpdateEntity>> {
        self.read_one(UPDATES, update_id)
    }

    pub fn list_updates(&self) -> StateResult<Vec<UpdateEntity>> {
        self.read_prefix(UPDATES, "")
    }

    /// Updates of one job, oldest first.
    pub fn list_updates_for_job(&self, job_id: &str) -> StateResult<Vec<UpdateEntity>> {
        let mut updates: Vec<UpdateEntity> = self
            .list_updates()?
            .into_iter()
            .filter(|u| u.job_id == job_id)
            .collect();
        updates.sort_by_key(|u| u.created_seq);
        Ok(updates)
    }

    // ── Hosts ──────────────────────────────────────────────────────

    pub fn get_host(&self, hostname: &str) -> StateResult<Option<HostEntity>> {
        self.read_one(HOSTS, hostname)
    }

    pub fn list_hosts(&self) -> StateResult<Vec<HostEntity>> {
        self.read_prefix(HOSTS, "")
    }

    /// Queued hostnames with their enqueue time, oldest first.
    pub fn list_maintenance_queue(&self) -> StateResult<Vec<(Hostname, u64)>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(MAINTENANCE_QUEUE).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let at: u64 = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push((key.value().to_string(), at));
        }
        results.sort_by_key(|(_, at)| *at);
        Ok(results)
    }

    // ── Commit ─────────────────────────────────────────────────────

    /// Apply a [`Commit`] atomically. On any failed precondition nothing
    /// is written and the error names the conflict.
    pub fn commit(&self, commit: Commit) -> StateResult<()> {
        if commit.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        match apply(&txn, &commit) {
            Ok(()) => {
                txn.commit().map_err(map_err!(Transaction))?;
                Ok(())
            }
            Err(e) => {
                txn.abort().map_err(map_err!(Transaction))?;
                debug!(error = %e, "commit rejected");
                Err(e)
            }
        }
    }
}

fn apply(txn: &redb::WriteTransaction, commit: &Commit) -> StateResult<()> {
    {
        let mut jobs = txn.open_table(JOBS).map_err(map_err!(Table))?;
        for write in &commit.jobs {
            let id = write.record.id.as_str();
            let stored: Option<JobRecord> = get_json(&jobs, id)?;
            match (write.expected, stored) {
                (None, Some(_)) => {
                    return Err(StateError::Conflict(format!("job {id} already exists")));
                }
                (Some(_), None) => return Err(StateError::NotFound(format!("job {id}"))),
                (Some(expected), Some(stored)) if stored.entity_version() != expected => {
                    return Err(StateError::VersionMismatch {
                        job: id.to_string(),
                        expected,
                        actual: stored.entity_version(),
                    });
                }
                _ => {}
            }
            put_json(&mut jobs, id, &write.record)?;
        }
    }

    {
        let mut configs = txn.open_table(JOB_CONFIGS).map_err(map_err!(Table))?;
        for (job_id, version, spec) in &commit.configs {
            let key = job_config_key(job_id, *version);
            let stored: Option<JobSpec> = get_json(&configs, &key)?;
            match stored {
                Some(existing) if existing != *spec => {
                    return Err(StateError::Conflict(format!(
                        "job {job_id} config version {version} already written"
                    )));
                }
                Some(_) => {}
                None => put_json(&mut configs, &key, spec)?,
            }
        }
    }

    {
        let mut pods = txn.open_table(PODS).map_err(map_err!(Table))?;
        for (job_id, instance_id) in &commit.removed_pods {
            pods.remove(pod_key(job_id, *instance_id).as_str())
                .map_err(map_err!(Write))?;
        }
        for pod in &commit.pods {
            put_json(&mut pods, &pod.table_key(), pod)?;
        }
    }

    {
        let mut updates = txn.open_table(UPDATES).map_err(map_err!(Table))?;
        for update in &commit.updates {
            let id = update.id.as_str();
            let stored: Option<UpdateEntity> = get_json(&updates, id)?;
            match stored {
                None if update.revision != 0 => {
                    return Err(StateError::NotFound(format!("update {id}")));
                }
                Some(stored) if stored.state.is_terminal() => {
                    return Err(StateError::Conflict(format!(
                        "update {id} is already {}",
                        stored.state
                    )));
                }
                Some(stored) if stored.revision != update.revision => {
                    return Err(StateError::Conflict(format!(
                        "update {id} revision {} is stale (stored {})",
                        update.revision, stored.revision
                    )));
                }
                _ => {}
            }
            let mut next = update.clone();
            next.revision = update.revision + 1;
            put_json(&mut updates, id, &next)?;
        }
    }

    {
        let mut hosts = txn.open_table(HOSTS).map_err(map_err!(Table))?;
        for write in &commit.hosts {
            let name = write.host.hostname.as_str();
            if let Some(expected) = write.expected {
                let stored: Option<HostEntity> = get_json(&hosts, name)?;
                match stored {
                    None => return Err(StateError::NotFound(format!("host {name}"))),
                    Some(stored) if stored.state != expected => {
                        return Err(StateError::HostStateMismatch {
                            host: name.to_string(),
                            expected,
                            actual: stored.state,
                        });
                    }
                    Some(_) => {}
                }
            }
            put_json(&mut hosts, name, &write.host)?;
        }
    }

    {
        let mut queue = txn.open_table(MAINTENANCE_QUEUE).map_err(map_err!(Table))?;
        for hostname in &commit.dequeue {
            queue.remove(hostname.as_str()).map_err(map_err!(Write))?;
        }
        for (hostname, at) in &commit.enqueue {
            put_json(&mut queue, hostname, at)?;
        }
    }

    Ok(())
}

fn get_json<T, R>(table: &R, key: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => {
            let value: T = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

fn put_json<T: Serialize>(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    key: &str,
    value: &T,
) -> StateResult<()> {
    let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
    table
        .insert(key, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_spec(instances: u32, command: &str) -> JobSpec {
        JobSpec {
            name: "web".to_string(),
            instance_count: instances,
            default_spec: PodSpec {
                containers: vec![ContainerSpec {
                    name: "main".to_string(),
                    command: command.to_string(),
                    health_check: None,
                }],
                ..Default::default()
            },
            instance_spec: Default::default(),
            constraint: None,
        }
    }

    fn test_job(id: &str) -> JobRecord {
        JobRecord {
            id: id.to_string(),
            config_version: 1,
            desired_state_version: 0,
            workflow_version: 0,
            goal: JobGoal::Running,
            state: JobState::Running,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn test_pod(job_id: &str, instance_id: u32, host: &str) -> PodInfo {
        PodInfo {
            job_id: job_id.to_string(),
            instance_id,
            run_id: 1,
            spec_version: 1,
            spec: test_spec(1, "sleep 10").effective_spec(instance_id),
            state: PodState::Running,
            host: Some(host.to_string()),
            attempts: 1,
            failure_reason: None,
            updated_at: 1000,
        }
    }

    fn test_update(id: &str, job_id: &str, seq: u64) -> UpdateEntity {
        UpdateEntity {
            id: id.to_string(),
            job_id: job_id.to_string(),
            prev_spec_version: 1,
            target_spec_version: 2,
            state: UpdateState::Initialized,
            paused_from: None,
            config: UpdateConfig::default(),
            rollback: false,
            plan: Vec::new(),
            planned: false,
            waves_completed: 0,
            instances_done: Vec::new(),
            instances_failed: Vec::new(),
            failure_reason: None,
            created_seq: seq,
            revision: 0,
            created_at: 1000,
            last_transition_at: 1000,
        }
    }

    fn test_host(name: &str, state: HostState) -> HostEntity {
        HostEntity {
            hostname: name.to_string(),
            state,
            maintenance_request_time: None,
            last_transition_at: 1000,
        }
    }

    // ── Jobs and configs ───────────────────────────────────────────

    #[test]
    fn job_create_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .commit(
                Commit::new()
                    .create_job(test_job("job-1"))
                    .put_config("job-1", 1, test_spec(3, "sleep 10")),
            )
            .unwrap();

        assert_eq!(store.get_job("job-1").unwrap(), Some(test_job("job-1")));
        assert_eq!(
            store.get_job_config("job-1", 1).unwrap().unwrap().instance_count,
            3
        );
        assert!(store.get_job_config("job-1", 2).unwrap().is_none());
    }

    #[test]
    fn job_create_twice_conflicts() {
        let store = StateStore::open_in_memory().unwrap();
        store.commit(Commit::new().create_job(test_job("job-1"))).unwrap();
        let err = store
            .commit(Commit::new().create_job(test_job("job-1")))
            .unwrap_err();
        assert!(matches!(err, StateError::Conflict(_)));
    }

    #[test]
    fn job_write_with_stale_version_is_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        let job = test_job("job-1");
        store.commit(Commit::new().create_job(job.clone())).unwrap();

        let mut next = job.clone();
        next.workflow_version += 1;
        store
            .commit(Commit::new().put_job(next.clone(), job.entity_version()))
            .unwrap();

        // Same expected version again: stored one moved on.
        let mut stale = job.clone();
        stale.workflow_version += 5;
        let err = store
            .commit(Commit::new().put_job(stale, job.entity_version()))
            .unwrap_err();
        assert!(matches!(err, StateError::VersionMismatch { .. }));
        assert!(err.is_conflict());
        assert_eq!(store.get_job("job-1").unwrap().unwrap(), next);
    }

    #[test]
    fn config_versions_are_immutable() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .commit(Commit::new().put_config("job-1", 1, test_spec(3, "a")))
            .unwrap();
        // Identical rewrite is fine.
        store
            .commit(Commit::new().put_config("job-1", 1, test_spec(3, "a")))
            .unwrap();
        let err = store
            .commit(Commit::new().put_config("job-1", 1, test_spec(3, "b")))
            .unwrap_err();
        assert!(matches!(err, StateError::Conflict(_)));
    }

    #[test]
    fn failed_precondition_writes_nothing() {
        let store = StateStore::open_in_memory().unwrap();
        let job = test_job("job-1");
        store.commit(Commit::new().create_job(job.clone())).unwrap();

        let bogus = EntityVersion {
            config: 9,
            desired_state: 9,
            workflow: 9,
        };
        let err = store
            .commit(
                Commit::new()
                    .put_pod(test_pod("job-1", 0, "host-a"))
                    .put_job(job, bogus),
            )
            .unwrap_err();
        assert!(matches!(err, StateError::VersionMismatch { .. }));
        assert!(store.list_pods_for_job("job-1").unwrap().is_empty());
    }

    // ── Pods ───────────────────────────────────────────────────────

    #[test]
    fn pods_listed_per_job_and_host() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_pod(&test_pod("job-1", 0, "host-a")).unwrap();
        store.put_pod(&test_pod("job-1", 1, "host-b")).unwrap();
        store.put_pod(&test_pod("job-2", 0, "host-a")).unwrap();
        let mut killed = test_pod("job-2", 1, "host-a");
        killed.state = PodState::Killed;
        store.put_pod(&killed).unwrap();

        let job1 = store.list_pods_for_job("job-1").unwrap();
        assert_eq!(job1.len(), 2);
        assert_eq!(job1[0].instance_id, 0);

        let on_a = store.list_pods_on_host("host-a").unwrap();
        assert_eq!(on_a.len(), 2);
    }

    #[test]
    fn pod_removal() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_pod(&test_pod("job-1", 0, "host-a")).unwrap();
        store.put_pod(&test_pod("job-1", 1, "host-a")).unwrap();
        store.commit(Commit::new().remove_pod("job-1", 1)).unwrap();
        assert!(store.get_pod("job-1", 1).unwrap().is_none());
        assert!(store.get_pod("job-1", 0).unwrap().is_some());
    }

    #[test]
    fn job_prefix_does_not_leak_into_similar_ids() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_pod(&test_pod("job-1", 0, "h")).unwrap();
        store.put_pod(&test_pod("job-10", 0, "h")).unwrap();
        assert_eq!(store.list_pods_for_job("job-1").unwrap().len(), 1);
    }

    // ── Updates ────────────────────────────────────────────────────

    #[test]
    fn update_revision_guards_writes() {
        let store = StateStore::open_in_memory().unwrap();
        let update = test_update("u-1", "job-1", 1);
        store.commit(Commit::new().put_update(update.clone())).unwrap();

        let stored = store.get_update("u-1").unwrap().unwrap();
        assert_eq!(stored.revision, 1);

        // Writing with the old revision loses.
        let err = store.commit(Commit::new().put_update(update)).unwrap_err();
        assert!(matches!(err, StateError::Conflict(_)));

        let mut next = stored.clone();
        next.state = UpdateState::RollingForward;
        store.commit(Commit::new().put_update(next)).unwrap();
        assert_eq!(store.get_update("u-1").unwrap().unwrap().revision, 2);
    }

    #[test]
    fn terminal_updates_are_immutable() {
        let store = StateStore::open_in_memory().unwrap();
        let mut update = test_update("u-1", "job-1", 1);
        update.state = UpdateState::Aborted;
        // Creating straight into a terminal state is allowed.
        store.commit(Commit::new().put_update(update)).unwrap();

        let mut stored = store.get_update("u-1").unwrap().unwrap();
        stored.state = UpdateState::RollingForward;
        let err = store.commit(Commit::new().put_update(stored)).unwrap_err();
        assert!(matches!(err, StateError::Conflict(_)));
    }

    #[test]
    fn updates_for_job_ordered_by_sequence() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .commit(
                Commit::new()
                    .put_update(test_update("b", "job-1", 2))
                    .put_update(test_update("a", "job-1", 3))
                    .put_update(test_update("c", "job-1", 1))
                    .put_update(test_update("d", "job-2", 1)),
            )
            .unwrap();
        let ids: Vec<String> = store
            .list_updates_for_job("job-1")
            .unwrap()
            .into_iter()
            .map(|u| u.id)
            .collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    // ── Hosts and queue ────────────────────────────────────────────

    #[test]
    fn host_state_precondition() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .commit(Commit::new().upsert_host(test_host("h1", HostState::Up)))
            .unwrap();

        store
            .commit(
                Commit::new()
                    .put_host(test_host("h1", HostState::Draining), HostState::Up)
                    .enqueue_host("h1", 5),
            )
            .unwrap();

        let err = store
            .commit(Commit::new().put_host(test_host("h1", HostState::Up), HostState::Down))
            .unwrap_err();
        assert!(matches!(
            err,
            StateError::HostStateMismatch {
                actual: HostState::Draining,
                ..
            }
        ));
        assert_eq!(
            store.list_maintenance_queue().unwrap(),
            vec![("h1".to_string(), 5)]
        );
    }

    #[test]
    fn unknown_host_precondition_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store
            .commit(Commit::new().put_host(test_host("ghost", HostState::Draining), HostState::Up))
            .unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[test]
    fn queue_orders_by_enqueue_time_and_dequeues() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .commit(
                Commit::new()
                    .enqueue_host("h2", 20)
                    .enqueue_host("h1", 30)
                    .enqueue_host("h3", 10),
            )
            .unwrap();
        store.commit(Commit::new().dequeue_host("h2")).unwrap();
        let queue: Vec<String> = store
            .list_maintenance_queue()
            .unwrap()
            .into_iter()
            .map(|(h, _)| h)
            .collect();
        assert_eq!(queue, vec!["h3", "h1"]);
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store
                .commit(
                    Commit::new()
                        .create_job(test_job("job-1"))
                        .put_update(test_update("u-1", "job-1", 1))
                        .upsert_host(test_host("h1", HostState::Draining))
                        .enqueue_host("h1", 1),
                )
                .unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        assert!(store.get_job("job-1").unwrap().is_some());
        assert_eq!(store.get_update("u-1").unwrap().unwrap().revision, 1);
        assert_eq!(
            store.get_host("h1").unwrap().unwrap().state,
            HostState::Draining
        );
        assert_eq!(store.list_maintenance_queue().unwrap().len(), 1);
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.list_jobs().unwrap().is_empty());
        assert!(store.list_updates().unwrap().is_empty());
        assert!(store.list_hosts().unwrap().is_empty());
        assert!(store.list_maintenance_queue().unwrap().is_empty());
        assert!(store.list_pods_on_host("any").unwrap().is_empty());
        store.commit(Commit::new()).unwrap();
    }
}
