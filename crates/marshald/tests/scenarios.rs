//! End-to-end scenarios for the Marshal control core.
//!
//! Every scenario runs in-process against a redb store (in memory, or in
//! a temp dir for restarts) and the simulated cluster.

use std::collections::BTreeMap;
use std::time::Duration;

use marshal_core::{MarshalConfig, StatusCode};
use marshal_state::*;
use marshal_update::UpdateError;
use marshald::Marshal;

const HOSTS: [&str; 3] = ["h1", "h2", "h3"];

fn config() -> MarshalConfig {
    MarshalConfig::from_toml_str(
        r#"
[update]
poll_interval_ms = 10
health_poll_interval_ms = 2
instance_timeout_secs = 5
default_max_instance_attempts = 1

[drain]
draining_period_secs = 1
"#,
    )
    .unwrap()
}

fn hosts() -> Vec<String> {
    HOSTS.iter().map(|h| h.to_string()).collect()
}

fn marshal_on(store: StateStore) -> Marshal {
    let marshal = Marshal::new(store, &config());
    marshal.bootstrap(&hosts()).unwrap();
    marshal
}

fn test_marshal() -> Marshal {
    marshal_on(StateStore::open_in_memory().unwrap())
}

fn container(command: &str) -> ContainerSpec {
    ContainerSpec {
        name: "main".to_string(),
        command: command.to_string(),
        health_check: None,
    }
}

fn job_spec(count: u32, command: &str) -> JobSpec {
    JobSpec {
        name: "web".to_string(),
        instance_count: count,
        default_spec: PodSpec {
            containers: vec![container(command)],
            ..Default::default()
        },
        instance_spec: BTreeMap::new(),
        constraint: None,
    }
}

fn commands(marshal: &Marshal, job: &str) -> Vec<String> {
    marshal
        .jobs
        .query_pods(job)
        .unwrap()
        .into_iter()
        .map(|p| p.spec.containers[0].command.clone())
        .collect()
}

fn version(marshal: &Marshal, job: &str) -> String {
    marshal.jobs.get_job(job).unwrap().entity_version().to_string()
}

fn host_state(marshal: &Marshal, host: &str) -> HostState {
    marshal.store.get_host(host).unwrap().unwrap().state
}

#[tokio::test]
async fn pod_count_matches_instance_count_after_success() {
    let m = test_marshal();
    let v1 = m.jobs.create_job("web", job_spec(3, "v1")).await.unwrap();

    let (id, _) = m
        .updates
        .create_update("web", job_spec(5, "v2"), &v1.to_string(), UpdateConfig::default())
        .unwrap();
    assert_eq!(m.updates.drive(&id).await.unwrap(), UpdateState::Succeeded);

    let pods = m.jobs.query_pods("web").unwrap();
    assert_eq!(pods.len(), 5);
    assert!(pods.iter().all(|p| p.state == PodState::Running && p.spec_version == 2));
    assert_eq!(m.cluster.running_pods().await.len(), 5);

    let (id, _) = m
        .updates
        .create_update("web", job_spec(2, "v2"), &version(&m, "web"), UpdateConfig::default())
        .unwrap();
    assert_eq!(m.updates.drive(&id).await.unwrap(), UpdateState::Succeeded);
    assert_eq!(m.jobs.query_pods("web").unwrap().len(), 2);
    assert_eq!(m.cluster.running_pods().await.len(), 2);
}

#[test]
fn complete_maintenance_on_up_host_errors() {
    let m = test_marshal();
    let err = m.drain.complete_maintenance(&["h1".to_string()]).unwrap_err();
    assert_eq!(err.code(), StatusCode::FailedPrecondition);
    assert_eq!(host_state(&m, "h1"), HostState::Up);
    assert!(m.store.list_maintenance_queue().unwrap().is_empty());
}

#[tokio::test]
async fn entity_version_is_monotonic_and_stale_versions_are_rejected() {
    let m = test_marshal();
    let v1 = m.jobs.create_job("web", job_spec(2, "v1")).await.unwrap();
    let (id, v2) = m
        .updates
        .create_update(
            "web",
            job_spec(2, "v2"),
            &v1.to_string(),
            UpdateConfig {
                batch_size: 1,
                ..Default::default()
            },
        )
        .unwrap();
    let v3 = m.updates.pause(&id, &v2.to_string()).unwrap();
    let v4 = m.updates.resume(&id, &v3.to_string()).unwrap();
    assert!(v1 < v2 && v2 < v3 && v3 < v4);

    for stale in [&v1, &v2, &v3] {
        let err = m.updates.pause(&id, &stale.to_string()).unwrap_err();
        assert!(matches!(err, UpdateError::VersionConflict { .. }));
        assert_eq!(err.code(), StatusCode::Aborted);
        assert!(err.to_string().contains("unexpected entity version"));
    }
    let err = m
        .updates
        .create_update("web", job_spec(2, "v3"), &v2.to_string(), UpdateConfig::default())
        .unwrap_err();
    assert_eq!(err.code(), StatusCode::Aborted);

    assert_eq!(m.updates.drive(&id).await.unwrap(), UpdateState::Succeeded);
    // Driving an update does not move the job's entity version.
    assert_eq!(version(&m, "web"), v4.to_string());
}

#[tokio::test]
async fn rollback_round_trip_restores_previous_spec() {
    let m = test_marshal();
    let original = job_spec(3, "v1");
    let v1 = m.jobs.create_job("web", original.clone()).await.unwrap();

    let config = UpdateConfig {
        batch_size: 2,
        max_failure_instances: 1,
        roll_back_on_failure: true,
        ..Default::default()
    };
    let (id, _) = m
        .updates
        .create_update("web", job_spec(3, "exit 1"), &v1.to_string(), config)
        .unwrap();
    assert_eq!(m.updates.drive(&id).await.unwrap(), UpdateState::RolledBack);

    let update = m.updates.get_update(&id).unwrap();
    assert!(update.rollback);
    assert!(update.failure_reason.is_some());

    // The restored spec is a new config version with the old content.
    let job = m.jobs.get_job("web").unwrap();
    assert_eq!(job.config_version, 3);
    assert_eq!(m.jobs.get_job_spec("web", None).unwrap(), original);
    assert_eq!(commands(&m, "web"), vec!["v1"; 3]);
    assert_eq!(m.cluster.running_pods().await.len(), 3);

    // The job takes further updates at its new version.
    let (id, _) = m
        .updates
        .create_update("web", job_spec(3, "v2"), &version(&m, "web"), UpdateConfig::default())
        .unwrap();
    assert_eq!(m.updates.drive(&id).await.unwrap(), UpdateState::Succeeded);
    assert_eq!(commands(&m, "web"), vec!["v2"; 3]);
}

#[tokio::test]
async fn batch_size_one_and_unset_reach_the_same_end_state() {
    let m = test_marshal();
    let mut results = Vec::new();
    for (job, batch_size) in [("one", 1), ("all", 0)] {
        let v1 = m.jobs.create_job(job, job_spec(3, "v1")).await.unwrap();
        let (id, _) = m
            .updates
            .create_update(
                job,
                job_spec(4, "v2"),
                &v1.to_string(),
                UpdateConfig {
                    batch_size,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(m.updates.drive(&id).await.unwrap(), UpdateState::Succeeded);
        let update = m.updates.get_update(&id).unwrap();
        results.push((commands(&m, job), update.waves_completed));
    }

    assert_eq!(results[0].0, results[1].0);
    assert_eq!(results[0].1, 4);
    assert_eq!(results[1].1, 1);
}

#[tokio::test]
async fn adding_instances_with_overrides() {
    let m = test_marshal();
    let v1 = m.jobs.create_job("web", job_spec(2, "v1")).await.unwrap();
    let before = m.jobs.query_pods("web").unwrap();

    let mut target = job_spec(4, "v1");
    target.instance_spec.insert(
        3,
        PodSpec {
            containers: vec![container("special")],
            ..Default::default()
        },
    );
    let (id, _) = m
        .updates
        .create_update("web", target, &v1.to_string(), UpdateConfig::default())
        .unwrap();
    assert_eq!(m.updates.drive(&id).await.unwrap(), UpdateState::Succeeded);

    let update = m.updates.get_update(&id).unwrap();
    assert_eq!(update.instances_of(InstanceChange::Added), vec![2, 3]);
    assert!(update.instances_of(InstanceChange::Modified).is_empty());

    let pods = m.jobs.query_pods("web").unwrap();
    assert_eq!(pods.len(), 4);
    assert_eq!(commands(&m, "web"), vec!["v1", "v1", "v1", "special"]);
    // Unchanged instances keep their run.
    assert_eq!(pods[0].pod_id(), before[0].pod_id());
    assert_eq!(pods[1].pod_id(), before[1].pod_id());
}

#[tokio::test]
async fn drain_lifecycle() {
    let m = test_marshal();
    let mut pinned = job_spec(2, "v1");
    pinned.constraint = Some(HostConstraint {
        hostname: "h1".to_string(),
    });
    m.jobs.create_job("pinned", pinned).await.unwrap();
    assert!(m
        .jobs
        .query_pods("pinned")
        .unwrap()
        .iter()
        .all(|p| p.host.as_deref() == Some("h1")));

    // A host with nothing on it drains in one cycle.
    m.drain.start_maintenance(&["h3".to_string()]).unwrap();
    assert_eq!(host_state(&m, "h3"), HostState::Draining);

    // The pinned job's pods have nowhere else to go.
    m.drain.start_maintenance(&["h1".to_string()]).unwrap();
    assert_eq!(host_state(&m, "h1"), HostState::Draining);

    let report = m.drain.run_cycle().await.unwrap();
    assert!(report.errors.is_empty());
    assert_eq!(report.evicted.len(), 2);
    assert_eq!(host_state(&m, "h1"), HostState::Down);
    assert_eq!(host_state(&m, "h3"), HostState::Down);
    assert!(m
        .jobs
        .query_pods("pinned")
        .unwrap()
        .iter()
        .all(|p| p.state == PodState::Pending && p.host.is_none()));
    assert!(m.store.list_maintenance_queue().unwrap().is_empty());

    // Starting maintenance again on a DOWN host is refused.
    assert!(m.drain.start_maintenance(&["h1".to_string()]).is_err());

    m.drain
        .complete_maintenance(&["h1".to_string(), "h3".to_string()])
        .unwrap();
    assert_eq!(host_state(&m, "h1"), HostState::Up);
    assert_eq!(m.drain.query_hosts(&[HostState::Up]).unwrap().len(), 3);
}

#[tokio::test]
async fn evicted_pods_are_relaunched_where_they_fit() {
    let m = test_marshal();
    let mut pinned = job_spec(1, "v1");
    pinned.constraint = Some(HostConstraint {
        hostname: "h1".to_string(),
    });
    m.jobs.create_job("pinned", pinned).await.unwrap();
    m.jobs.create_job("free", job_spec(3, "v1")).await.unwrap();
    let free_on_h1: Vec<u32> = m
        .jobs
        .query_pods("free")
        .unwrap()
        .into_iter()
        .filter(|p| p.host.as_deref() == Some("h1"))
        .map(|p| p.instance_id)
        .collect();

    m.drain.start_maintenance(&["h1".to_string()]).unwrap();
    let report = m.drain.run_cycle().await.unwrap();
    assert_eq!(report.evicted.len(), 1 + free_on_h1.len());
    assert_eq!(host_state(&m, "h1"), HostState::Down);

    // Unpinned pods find another host; the pinned one waits for h1.
    let relaunched = m.updates.reconcile_pending().await.unwrap();
    let expected: Vec<(String, u32)> = free_on_h1.iter().map(|&i| ("free".to_string(), i)).collect();
    assert_eq!(relaunched, expected);
    assert!(m
        .jobs
        .query_pods("free")
        .unwrap()
        .iter()
        .all(|p| p.state == PodState::Running && p.host.as_deref() != Some("h1")));
    assert_eq!(m.jobs.get_pod("pinned", 0).unwrap().state, PodState::Pending);

    m.drain.complete_maintenance(&["h1".to_string()]).unwrap();
    let relaunched = m.updates.reconcile_pending().await.unwrap();
    assert_eq!(relaunched, vec![("pinned".to_string(), 0)]);
    let pod = m.jobs.get_pod("pinned", 0).unwrap();
    assert_eq!(pod.state, PodState::Running);
    assert_eq!(pod.host.as_deref(), Some("h1"));
    assert_eq!(m.cluster.running_pods().await.len(), 4);
}

#[tokio::test]
async fn failing_additions_leave_existing_instances_alone() {
    let m = test_marshal();
    let v1 = m.jobs.create_job("web", job_spec(3, "v1")).await.unwrap();
    let before = m.jobs.query_pods("web").unwrap();

    let config = UpdateConfig {
        batch_size: 1,
        max_failure_instances: 1,
        ..Default::default()
    };
    let (id, _) = m
        .updates
        .create_update("web", job_spec(6, "exit 1"), &v1.to_string(), config)
        .unwrap();
    assert_eq!(m.updates.drive(&id).await.unwrap(), UpdateState::Failed);

    // New instances go first, so the failure lands before any running
    // instance is replaced.
    let update = m.updates.get_update(&id).unwrap();
    assert_eq!(update.instances_failed, vec![3]);
    let pods = m.jobs.query_pods("web").unwrap();
    assert_eq!(pods.len(), 4);
    for (old, new) in before.iter().zip(&pods) {
        assert_eq!(old.pod_id(), new.pod_id());
        assert_eq!(new.state, PodState::Running);
    }
    assert_eq!(pods[3].state, PodState::Failed);
    assert_eq!(m.cluster.running_pods().await.len(), 3);
}

#[tokio::test]
async fn failing_health_check_rolls_back() {
    let m = test_marshal();
    let v1 = m.jobs.create_job("web", job_spec(3, "v1")).await.unwrap();

    let mut target = job_spec(3, "v2");
    target.default_spec.containers[0].health_check = Some(HealthCheckSpec {
        enabled: true,
        command: "exit 1".to_string(),
        initial_interval_secs: 0,
        interval_secs: 1,
        max_consecutive_failures: 2,
        timeout_secs: 1,
    });
    let config = UpdateConfig {
        batch_size: 1,
        max_failure_instances: 1,
        roll_back_on_failure: true,
        ..Default::default()
    };
    let (id, _) = m
        .updates
        .create_update("web", target, &v1.to_string(), config)
        .unwrap();
    assert_eq!(m.updates.drive(&id).await.unwrap(), UpdateState::RolledBack);

    let update = m.updates.get_update(&id).unwrap();
    assert!(update.failure_reason.unwrap().contains("instances failed"));
    let pods = m.jobs.query_pods("web").unwrap();
    assert!(pods
        .iter()
        .all(|p| p.state == PodState::Running && p.spec.containers[0].health_check.is_none()));
}

#[tokio::test]
async fn update_paused_before_first_wave_touches_nothing() {
    let m = test_marshal();
    let v1 = m.jobs.create_job("web", job_spec(3, "v1")).await.unwrap();
    let before = m.jobs.query_pods("web").unwrap();
    let launches = m.cluster.launch_count().await;

    let (id, v2) = m
        .updates
        .create_update(
            "web",
            job_spec(3, "v2"),
            &v1.to_string(),
            UpdateConfig {
                start_paused: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(m.updates.get_update(&id).unwrap().state, UpdateState::Paused);
    assert_eq!(m.updates.drive(&id).await.unwrap(), UpdateState::Paused);
    assert_eq!(m.cluster.launch_count().await, launches);
    assert_eq!(m.jobs.query_pods("web").unwrap(), before);

    m.updates.resume(&id, &v2.to_string()).unwrap();
    assert_eq!(m.updates.drive(&id).await.unwrap(), UpdateState::Succeeded);
    assert_eq!(commands(&m, "web"), vec!["v2"; 3]);
}

#[tokio::test]
async fn restart_resumes_updates_and_drains() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("marshal.redb");
    let id = {
        let m = marshal_on(StateStore::open(&path).unwrap());
        let v1 = m.jobs.create_job("web", job_spec(3, "v1")).await.unwrap();
        let (id, _) = m
            .updates
            .create_update(
                "web",
                job_spec(3, "v2"),
                &v1.to_string(),
                UpdateConfig {
                    batch_size: 1,
                    ..Default::default()
                },
            )
            .unwrap();
        // Plan and run the first wave, then go away.
        m.updates.step(&id).await.unwrap();
        m.updates.step(&id).await.unwrap();
        m.drain.start_maintenance(&["h3".to_string()]).unwrap();
        id
    };

    let m = Marshal::new(StateStore::open(&path).unwrap(), &config());
    let report = m.bootstrap(&hosts()).unwrap();
    assert_eq!(report.updates.resumed, vec![id.clone()]);
    assert!(report.updates.failed.is_empty());

    let update = m.updates.get_update(&id).unwrap();
    assert_eq!(update.waves_completed, 1);
    let first = m.jobs.get_pod("web", 0).unwrap();

    assert_eq!(m.updates.drive(&id).await.unwrap(), UpdateState::Succeeded);
    assert_eq!(m.updates.get_update(&id).unwrap().waves_completed, 3);
    // The committed wave was not replayed.
    assert_eq!(m.jobs.get_pod("web", 0).unwrap().run_id, first.run_id);
    assert_eq!(commands(&m, "web"), vec!["v2"; 3]);

    assert_eq!(host_state(&m, "h3"), HostState::Draining);
    m.drain.run_cycle().await.unwrap();
    assert_eq!(host_state(&m, "h3"), HostState::Down);
}

#[tokio::test]
async fn background_loops_finish_work_and_stop() {
    let m = test_marshal();
    let v1 = m.jobs.create_job("web", job_spec(2, "v1")).await.unwrap();
    let (id, _) = m
        .updates
        .create_update("web", job_spec(2, "v2"), &v1.to_string(), UpdateConfig::default())
        .unwrap();
    m.drain.start_maintenance(&["h3".to_string()]).unwrap();

    let (tx, rx) = tokio::sync::watch::channel(false);
    let looped = m.clone();
    let handle = tokio::spawn(async move { looped.run(rx).await });

    for _ in 0..300 {
        let done = m.updates.get_update(&id).unwrap().state == UpdateState::Succeeded
            && host_state(&m, "h3") == HostState::Down;
        if done {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(m.updates.get_update(&id).unwrap().state, UpdateState::Succeeded);
    assert_eq!(host_state(&m, "h3"), HostState::Down);

    tx.send(true).unwrap();
    handle.await.unwrap();
}
