//! Paced health checking for one pod run.
//!
//! A [`HealthTracker`] decides when the next check is due and folds check
//! outcomes into a [`HealthStatus`]. The first check waits
//! `initial_interval_secs` after the run started; later checks follow every
//! `interval_secs`. A run turns unhealthy after `max_consecutive_failures`
//! failed checks in a row and healthy on its first passing one.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use marshal_state::HealthCheckSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone)]
pub struct HealthTracker {
    interval: Duration,
    failure_limit: u32,
    next_probe: Instant,
    failures: u32,
    status: HealthStatus,
}

impl HealthTracker {
    pub fn new(spec: &HealthCheckSpec, started: Instant) -> Self {
        Self {
            interval: Duration::from_secs(u64::from(spec.interval_secs)),
            failure_limit: spec.max_consecutive_failures.max(1),
            next_probe: started + Duration::from_secs(u64::from(spec.initial_interval_secs)),
            failures: 0,
            status: HealthStatus::Unknown,
        }
    }

    /// Whether a check should run at `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_probe
    }

    /// When the next check is due.
    pub fn next_probe(&self) -> Instant {
        self.next_probe
    }

    /// Fold in the outcome of a check that ran at `now`.
    pub fn record(&mut self, passed: bool, now: Instant) -> HealthStatus {
        self.next_probe = now + self.interval;
        if passed {
            if self.status != HealthStatus::Healthy {
                debug!(after_failures = self.failures, "health check passed");
            }
            self.failures = 0;
            self.status = HealthStatus::Healthy;
            return self.status;
        }

        self.failures += 1;
        if self.failures >= self.failure_limit && self.status != HealthStatus::Unhealthy {
            warn!(failures = self.failures, "health check failure limit reached");
            self.status = HealthStatus::Unhealthy;
        }
        self.status
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }
}
