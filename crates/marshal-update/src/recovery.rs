//! Update recovery after a controller restart.
//!
//! Non-terminal updates are either failed (their job or target config
//! vanished) or left as they are: progress lives in the update record,
//! so the engine's next tick resumes them at `waves_completed` without
//! replaying committed waves.

use tracing::{info, warn};

use marshal_state::{epoch_millis, Commit, StateStore, UpdateId};

use crate::error::UpdateResult;
use crate::machine;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub resumed: Vec<UpdateId>,
    pub failed: Vec<UpdateId>,
}

pub fn recover_updates(store: &StateStore) -> UpdateResult<RecoveryReport> {
    let mut report = RecoveryReport::default();

    for mut update in store.list_updates()? {
        if update.state.is_terminal() {
            continue;
        }

        let missing = if store.get_job(&update.job_id)?.is_none() {
            Some(format!("job {} no longer exists", update.job_id))
        } else if store
            .get_job_config(&update.job_id, update.target_spec_version)?
            .is_none()
        {
            Some(format!(
                "config version {} of job {} is missing",
                update.target_spec_version, update.job_id
            ))
        } else {
            None
        };

        match missing {
            Some(reason) => {
                warn!(update = %update.id, %reason, "failing unrecoverable update");
                let id = update.id.clone();
                machine::fail(&mut update, reason, epoch_millis());
                store.commit(Commit::new().put_update(update))?;
                report.failed.push(id);
            }
            None => {
                info!(
                    update = %update.id,
                    job = %update.job_id,
                    state = %update.state,
                    waves_completed = update.waves_completed,
                    rollback = update.rollback,
                    "resuming update"
                );
                report.resumed.push(update.id);
            }
        }
    }

    Ok(report)
}
