//! Pod spec differ: which instances an update has to touch.
//!
//! Instances are compared by their *effective* spec, so a change to the
//! default spec only counts for instances without an override.

use std::collections::BTreeMap;

use marshal_state::{InstanceChange, JobSpec, PlannedInstance, PodInfo};

/// Classify every index in `0..max(old, new)` between two job generations.
pub fn diff_specs(old: &JobSpec, new: &JobSpec) -> Vec<PlannedInstance> {
    let count = old.instance_count.max(new.instance_count);
    (0..count)
        .map(|i| {
            let change = match (i < old.instance_count, i < new.instance_count) {
                (true, true) if old.effective_spec(i) == new.effective_spec(i) => {
                    InstanceChange::Unchanged
                }
                (true, true) => InstanceChange::Modified,
                (false, true) => InstanceChange::Added,
                _ => InstanceChange::Removed,
            };
            PlannedInstance {
                instance_id: i,
                change,
            }
        })
        .collect()
}

/// Classify instances against what each pod actually records.
///
/// Used for planning, so an earlier aborted or partially applied update
/// is accounted for: an instance is unchanged only if its pod already
/// carries the new effective spec. With `relaunch_stopped`, a pod that is
/// not resident (killed, failed, pending) counts as modified even when its
/// spec matches, so a running job gets it back.
pub fn diff_pods(pods: &[PodInfo], new: &JobSpec, relaunch_stopped: bool) -> Vec<PlannedInstance> {
    let by_index: BTreeMap<u32, &PodInfo> = pods.iter().map(|p| (p.instance_id, p)).collect();
    let highest = by_index.keys().next_back().map(|i| i + 1).unwrap_or(0);
    let count = highest.max(new.instance_count);

    (0..count)
        .filter_map(|i| {
            let change = match (by_index.get(&i), i < new.instance_count) {
                (Some(pod), true)
                    if pod.spec == new.effective_spec(i)
                        && (pod.state.is_resident() || !relaunch_stopped) =>
                {
                    InstanceChange::Unchanged
                }
                (Some(_), true) => InstanceChange::Modified,
                (None, true) => InstanceChange::Added,
                (Some(_), false) => InstanceChange::Removed,
                (None, false) => return None,
            };
            Some(PlannedInstance {
                instance_id: i,
                change,
            })
        })
        .collect()
}

/// Only the instances that need work: added first, then modified, then
/// removed, each group in index order.
pub fn actionable(plan: Vec<PlannedInstance>) -> Vec<PlannedInstance> {
    let mut work: Vec<PlannedInstance> = plan
        .into_iter()
        .filter(|p| p.change != InstanceChange::Unchanged)
        .collect();
    work.sort_by_key(|p| (dispatch_rank(p.change), p.instance_id));
    work
}

fn dispatch_rank(change: InstanceChange) -> u8 {
    match change {
        InstanceChange::Added => 0,
        InstanceChange::Modified => 1,
        InstanceChange::Removed => 2,
        InstanceChange::Unchanged => 3,
    }
}
