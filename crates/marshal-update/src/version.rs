//! Entity version ledger and job spec validation.
//!
//! A job's [`EntityVersion`] moves forward on every mutating call:
//! creating an update bumps `config` and `workflow`, pause/resume/abort
//! bump `workflow`, start/stop bump `desired_state`. The helpers here
//! compute the next [`JobRecord`]; the store enforces the precondition.

use marshal_state::{EntityVersion, JobGoal, JobRecord, JobSpec, PodSpec};

use crate::error::{UpdateError, UpdateResult};

/// Parse a caller-supplied version string.
pub fn parse(raw: &str) -> UpdateResult<EntityVersion> {
    raw.parse::<EntityVersion>()
        .map_err(|e| UpdateError::InvalidArgument(e.to_string()))
}

/// Reject a stale version before doing any work.
pub fn check(job: &JobRecord, presented: EntityVersion) -> UpdateResult<()> {
    let actual = job.entity_version();
    if actual != presented {
        return Err(UpdateError::VersionConflict {
            job: job.id.clone(),
            presented,
            actual,
        });
    }
    Ok(())
}

/// A new spec version is in force.
pub fn with_config(job: &JobRecord, config_version: u64, now: u64) -> JobRecord {
    JobRecord {
        config_version,
        workflow_version: job.workflow_version + 1,
        updated_at: now,
        ..job.clone()
    }
}

/// A workflow (update) changed state on operator request.
pub fn with_workflow_bump(job: &JobRecord, now: u64) -> JobRecord {
    JobRecord {
        workflow_version: job.workflow_version + 1,
        updated_at: now,
        ..job.clone()
    }
}

/// The operator changed the job's goal.
pub fn with_goal(job: &JobRecord, goal: JobGoal, now: u64) -> JobRecord {
    JobRecord {
        goal,
        desired_state_version: job.desired_state_version + 1,
        updated_at: now,
        ..job.clone()
    }
}

/// Check a job spec before it is stored.
pub fn validate_spec(spec: &JobSpec) -> UpdateResult<()> {
    let invalid = |msg: String| Err(UpdateError::InvalidArgument(msg));

    if spec.name.trim().is_empty() {
        return invalid("job name must not be empty".to_string());
    }
    validate_pod_spec(&spec.default_spec, "default_spec")?;
    for (index, pod) in &spec.instance_spec {
        if *index >= spec.instance_count {
            return invalid(format!(
                "instance_spec for instance {index} but job has {} instances",
                spec.instance_count
            ));
        }
        validate_pod_spec(pod, &format!("instance_spec[{index}]"))?;
    }
    if let Some(constraint) = &spec.constraint {
        if constraint.hostname.trim().is_empty() {
            return invalid("constraint hostname must not be empty".to_string());
        }
    }
    Ok(())
}

fn validate_pod_spec(pod: &PodSpec, path: &str) -> UpdateResult<()> {
    let invalid = |msg: String| Err(UpdateError::InvalidArgument(msg));

    if pod.containers.is_empty() {
        return invalid(format!("{path}: at least one container is required"));
    }
    for container in &pod.containers {
        if container.name.trim().is_empty() {
            return invalid(format!("{path}: container name must not be empty"));
        }
        if container.command.trim().is_empty() {
            return invalid(format!(
                "{path}: container {} has no command",
                container.name
            ));
        }
        if let Some(hc) = &container.health_check {
            if hc.enabled && hc.command.trim().is_empty() {
                return invalid(format!(
                    "{path}: container {} enables a health check without a command",
                    container.name
                ));
            }
        }
    }
    if let Some(constraint) = &pod.constraint {
        if constraint.hostname.trim().is_empty() {
            return invalid(format!("{path}: constraint hostname must not be empty"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use marshal_state::{ContainerSpec, HealthCheckSpec, JobState};

    fn job() -> JobRecord {
        JobRecord {
            id: "web".to_string(),
            config_version: 2,
            desired_state_version: 1,
            workflow_version: 4,
            goal: JobGoal::Running,
            state: JobState::Running,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn spec() -> JobSpec {
        JobSpec {
            name: "web".to_string(),
            instance_count: 2,
            default_spec: PodSpec {
                containers: vec![ContainerSpec {
                    name: "main".to_string(),
                    command: "sleep 100".to_string(),
                    health_check: None,
                }],
                ..Default::default()
            },
            instance_spec: Default::default(),
            constraint: None,
        }
    }

    #[test]
    fn malformed_version_is_invalid_argument() {
        assert!(matches!(parse("1-2"), Err(UpdateError::InvalidArgument(_))));
        assert_eq!(parse("1-2-3").unwrap().to_string(), "1-2-3");
    }

    #[test]
    fn stale_version_is_rejected() {
        let job = job();
        check(&job, "2-1-4".parse().unwrap()).unwrap();
        let err = check(&job, "1-2-3".parse().unwrap()).unwrap_err();
        assert!(err.to_string().contains("unexpected entity version"));
    }

    #[test]
    fn every_bump_moves_version_forward() {
        let job = job();
        let before = job.entity_version();
        let bumped = [
            with_config(&job, 3, 1).entity_version(),
            with_workflow_bump(&job, 1).entity_version(),
            with_goal(&job, JobGoal::Killed, 1).entity_version(),
        ];
        for after in bumped {
            assert!(after > before);
            assert!(after.config >= before.config);
            assert!(after.desired_state >= before.desired_state);
            assert!(after.workflow >= before.workflow);
        }
    }

    #[test]
    fn valid_spec_passes() {
        validate_spec(&spec()).unwrap();
    }

    #[test]
    fn spec_without_containers_is_rejected() {
        let mut bad = spec();
        bad.default_spec.containers.clear();
        assert!(matches!(validate_spec(&bad), Err(UpdateError::InvalidArgument(_))));
    }

    #[test]
    fn override_beyond_instance_count_is_rejected() {
        let mut bad = spec();
        bad.instance_spec.insert(5, bad.default_spec.clone());
        assert!(validate_spec(&bad).is_err());
    }

    #[test]
    fn enabled_health_check_needs_command() {
        let mut bad = spec();
        bad.default_spec.containers[0].health_check = Some(HealthCheckSpec {
            enabled: true,
            command: " ".to_string(),
            initial_interval_secs: 0,
            interval_secs: 1,
            max_consecutive_failures: 3,
            timeout_secs: 1,
        });
        assert!(validate_spec(&bad).is_err());
    }
}
