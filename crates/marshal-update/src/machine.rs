//! Update state machine.
//!
//! Pure transitions over [`UpdateEntity`]; nothing here touches the store
//! or the cluster. The engine loads an update, applies one of these,
//! and commits the result.
//!
//! ```text
//! INITIALIZED ──plan──▶ ROLLING_FORWARD ──last wave──▶ SUCCEEDED | ROLLED_BACK
//!      │                  │   ▲       │
//!      │ pause      pause │   │resume └─budget spent──▶ FAILED (or rollback)
//!      └────────▶ PAUSED ◀┘───┘
//! any non-terminal ──abort──▶ ABORTED
//! ```

use tracing::{debug, info, warn};

use marshal_state::{JobId, PlannedInstance, UpdateConfig, UpdateEntity, UpdateState};

use crate::error::{UpdateError, UpdateResult};

/// Result of one dispatched wave.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaveOutcome {
    pub converged: Vec<u32>,
    pub failed: Vec<(u32, String)>,
}

/// What the engine should do after recording progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// More waves to run.
    Continue,
    /// Every wave ran; reconcile pods and finish.
    Complete,
    /// The failure budget is spent.
    Fail(String),
    /// The failure budget is spent and the update asked to roll back.
    RollBack(String),
}

/// A fresh update record, `INITIALIZED` or `PAUSED` when it starts paused.
pub fn new_update(
    job_id: &JobId,
    prev_spec_version: u64,
    target_spec_version: u64,
    config: UpdateConfig,
    created_seq: u64,
    now: u64,
) -> UpdateEntity {
    let (state, paused_from) = if config.start_paused {
        (UpdateState::Paused, Some(UpdateState::Initialized))
    } else {
        (UpdateState::Initialized, None)
    };
    UpdateEntity {
        id: uuid::Uuid::new_v4().to_string(),
        job_id: job_id.clone(),
        prev_spec_version,
        target_spec_version,
        state,
        paused_from,
        config,
        rollback: false,
        plan: Vec::new(),
        planned: false,
        waves_completed: 0,
        instances_done: Vec::new(),
        instances_failed: Vec::new(),
        failure_reason: None,
        created_seq,
        revision: 0,
        created_at: now,
        last_transition_at: now,
    }
}

fn transition(update: &mut UpdateEntity, to: UpdateState, now: u64) {
    debug!(update = %update.id, from = %update.state, to = %to, "update transition");
    update.state = to;
    update.last_transition_at = now;
}

fn terminal_error(update: &UpdateEntity, op: &str) -> UpdateError {
    UpdateError::InvalidState(format!(
        "cannot {op} update {}: it is {}",
        update.id, update.state
    ))
}

pub fn pause(update: &mut UpdateEntity, now: u64) -> UpdateResult<()> {
    match update.state {
        UpdateState::Initialized | UpdateState::RollingForward => {
            update.paused_from = Some(update.state);
            transition(update, UpdateState::Paused, now);
            info!(update = %update.id, "update paused");
            Ok(())
        }
        _ => Err(terminal_error(update, "pause")),
    }
}

/// Resume a paused update into `ROLLING_FORWARD`, or back to
/// `INITIALIZED` when it has not been planned and must still wait its turn.
pub fn resume(update: &mut UpdateEntity, must_wait: bool, now: u64) -> UpdateResult<()> {
    if update.state != UpdateState::Paused {
        return Err(terminal_error(update, "resume"));
    }
    let to = if must_wait && !update.planned {
        UpdateState::Initialized
    } else {
        UpdateState::RollingForward
    };
    update.paused_from = None;
    transition(update, to, now);
    info!(update = %update.id, state = %to, "update resumed");
    Ok(())
}

pub fn abort(update: &mut UpdateEntity, reason: Option<String>, now: u64) -> UpdateResult<()> {
    if update.state.is_terminal() {
        return Err(terminal_error(update, "abort"));
    }
    update.paused_from = None;
    if reason.is_some() {
        update.failure_reason = reason;
    }
    transition(update, UpdateState::Aborted, now);
    info!(update = %update.id, "update aborted");
    Ok(())
}

/// Store the instance plan; an `INITIALIZED` update starts rolling.
pub fn begin(update: &mut UpdateEntity, plan: Vec<PlannedInstance>, now: u64) {
    update.plan = plan;
    update.planned = true;
    update.waves_completed = 0;
    if update.state == UpdateState::Initialized {
        transition(update, UpdateState::RollingForward, now);
    }
    info!(
        update = %update.id,
        instances = update.plan.len(),
        waves = total_waves(update),
        "update planned"
    );
}

/// Partition a plan into waves of at most `batch_size`, preserving order.
/// A batch size of 0 means one wave with everything.
pub fn waves(plan: &[PlannedInstance], batch_size: u32) -> Vec<Vec<PlannedInstance>> {
    if plan.is_empty() {
        return Vec::new();
    }
    if batch_size == 0 {
        return vec![plan.to_vec()];
    }
    plan.chunks(batch_size as usize).map(|c| c.to_vec()).collect()
}

pub fn total_waves(update: &UpdateEntity) -> u32 {
    waves(&update.plan, update.config.batch_size).len() as u32
}

/// The next wave to dispatch, if any.
pub fn next_wave(update: &UpdateEntity) -> Option<Vec<PlannedInstance>> {
    waves(&update.plan, update.config.batch_size)
        .into_iter()
        .nth(update.waves_completed as usize)
}

/// Fold a wave's outcome into the update. Replaying the same wave is a no-op.
pub fn record_wave(update: &mut UpdateEntity, wave_index: u32, outcome: &WaveOutcome) {
    if wave_index < update.waves_completed {
        return;
    }
    for id in &outcome.converged {
        if !update.instances_done.contains(id) {
            update.instances_done.push(*id);
        }
    }
    for (id, reason) in &outcome.failed {
        if !update.instances_failed.contains(id) {
            update.instances_failed.push(*id);
        }
        if !update.rollback {
            update.failure_reason = Some(format!("instance {id}: {reason}"));
        }
    }
    update.waves_completed = wave_index + 1;
}

pub fn evaluate(update: &UpdateEntity) -> Verdict {
    let failed = update.instances_failed.len() as u32;
    let budget = update.config.max_failure_instances;
    if !update.rollback && budget > 0 && failed >= budget {
        let reason = format!("{failed} instances failed (max_failure_instances = {budget})");
        warn!(update = %update.id, failed, budget, "failure budget spent");
        return if update.config.roll_back_on_failure {
            Verdict::RollBack(reason)
        } else {
            Verdict::Fail(reason)
        };
    }
    if update.waves_completed >= total_waves(update) {
        Verdict::Complete
    } else {
        Verdict::Continue
    }
}

/// Turn the update around: drive the job to `rollback_version`, a fresh
/// copy of the pre-update spec.
pub fn start_rollback(
    update: &mut UpdateEntity,
    rollback_version: u64,
    plan: Vec<PlannedInstance>,
    reason: String,
    now: u64,
) {
    update.rollback = true;
    update.prev_spec_version = update.target_spec_version;
    update.target_spec_version = rollback_version;
    update.failure_reason = Some(reason);
    update.instances_done.clear();
    update.instances_failed.clear();
    update.plan = plan;
    update.planned = true;
    update.waves_completed = 0;
    update.last_transition_at = now;
    warn!(
        update = %update.id,
        target = rollback_version,
        instances = update.plan.len(),
        "rolling back"
    );
}

pub fn finish(update: &mut UpdateEntity, now: u64) {
    let to = if update.rollback {
        UpdateState::RolledBack
    } else {
        UpdateState::Succeeded
    };
    transition(update, to, now);
    info!(update = %update.id, state = %to, "update finished");
}

pub fn fail(update: &mut UpdateEntity, reason: String, now: u64) {
    update.failure_reason = Some(reason);
    transition(update, UpdateState::Failed, now);
    warn!(update = %update.id, reason = ?update.failure_reason, "update failed");
}
