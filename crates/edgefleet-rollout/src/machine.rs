//! Rollout state machine — `Pending → Active ⇄ Suspended → Completed`.
//!
//! Transitions are recomputed from scratch on every evaluation: suspension
//! is entered only while its cause holds, so a rollout resumes on its own
//! once devices recover or the policy is corrected. No operator retry verb
//! exists. `Completed` is terminal for a given template version; the next
//! fleet write re-enters `Pending`.

use std::collections::HashMap;

use tracing::debug;

use edgefleet_core::{
    Device, DeviceHealth, Fleet, Percentage, RolloutState, RolloutStatus, SuspendReason,
    TemplateVersion,
};

use crate::planner::{PlannedBatch, RolloutPlan};

/// Reconcile persisted rollout state with the fleet spec.
///
/// Any fleet write — template-version bump or policy edit — restarts
/// planning from batch 0 against the current device population. Devices
/// already converged are excluded by the planner, so a same-version
/// policy edit never redundantly disrupts them.
pub fn observe_fleet(existing: Option<RolloutState>, fleet: &Fleet, now: u64) -> RolloutState {
    match existing {
        Some(state) if state.fleet_revision == fleet.resource_version => state,
        Some(state) => {
            debug!(
                fleet = %fleet.name,
                old_version = state.template_version,
                new_version = fleet.template.version,
                "fleet changed, restarting rollout from batch 0"
            );
            RolloutState::pending(&fleet.name, fleet.template.version, fleet.resource_version, now)
        }
        None => {
            RolloutState::pending(&fleet.name, fleet.template.version, fleet.resource_version, now)
        }
    }
}

/// Per-batch convergence tally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchProgress {
    pub selected: usize,
    /// Devices converged to the target version and healthy.
    pub succeeded: usize,
    /// Devices in a terminal failure state (reported unhealthy).
    pub failed: usize,
    /// Devices still updating or not yet reported.
    pub pending: usize,
}

/// Tally the selected devices of a batch against the live snapshot.
pub fn batch_progress(
    batch: &PlannedBatch,
    devices: &[Device],
    version: TemplateVersion,
) -> BatchProgress {
    let by_id: HashMap<&str, &Device> = devices
        .iter()
        .map(|d| (d.fingerprint.as_str(), d))
        .collect();

    let mut progress = BatchProgress {
        selected: batch.devices.len(),
        succeeded: 0,
        failed: 0,
        pending: 0,
    };
    for id in &batch.devices {
        match by_id.get(id.as_str()) {
            Some(d) if d.converged_to(version) => progress.succeeded += 1,
            Some(d) if d.status.health == DeviceHealth::Unhealthy => progress.failed += 1,
            // Missing devices were deleted mid-rollout; treat as pending,
            // the next planning pass drops them from the batch.
            _ => progress.pending += 1,
        }
    }
    progress
}

/// Drive the state machine one step against the current plan and snapshot.
///
/// Walks forward from the persisted batch index, skipping empty batches
/// and advancing through any batch whose success threshold is already
/// met, all within the same evaluation pass. The batch index never moves
/// backward.
pub fn evaluate(
    mut state: RolloutState,
    plan: &RolloutPlan,
    devices: &[Device],
    timeout_secs: u64,
    overall_threshold: Percentage,
    now: u64,
) -> RolloutState {
    // Terminal for this template version.
    if state.status == RolloutStatus::Completed {
        return state;
    }

    loop {
        let Some(batch) = plan.batch(state.batch_index) else {
            // Ran past the last batch: the overall threshold gates the
            // final Completed status.
            let total = devices.len();
            let converged = devices
                .iter()
                .filter(|d| d.converged_to(plan.template_version))
                .count();
            let required = required_successes(overall_threshold, total);
            if converged >= required {
                state.status = RolloutStatus::Completed;
                state.reason = None;
                state.message = Some(format!(
                    "{converged}/{total} devices converged to version {}",
                    plan.template_version
                ));
            } else {
                suspend(
                    &mut state,
                    SuspendReason::SuccessThresholdNotMet,
                    format!(
                        "fleet: {converged}/{total} devices converged, {required} required"
                    ),
                );
            }
            return state;
        };

        if batch.is_empty() {
            advance(&mut state, now);
            continue;
        }

        let progress = batch_progress(batch, devices, plan.template_version);
        let required = required_successes(batch.success_threshold, progress.selected);

        // A new success restarts the update-timeout clock. Budget-held
        // devices are admitted only once earlier ones finish, so their
        // window starts when admission opens, not at batch start.
        if progress.succeeded > state.batch_succeeded {
            state.batch_succeeded = progress.succeeded;
            state.batch_started_at = now;
        }

        if progress.succeeded >= required {
            advance(&mut state, now);
            continue;
        }

        if progress.pending == 0 {
            // Every selected device reported terminal status and the
            // threshold is still unmet.
            let message = format!(
                "batch {}: {}/{} devices converged, {} required",
                state.batch_index, progress.succeeded, progress.selected, required
            );
            suspend(&mut state, SuspendReason::SuccessThresholdNotMet, message);
            return state;
        }

        if now.saturating_sub(state.batch_started_at) > timeout_secs {
            let message = format!(
                "batch {}: {} devices still updating after {timeout_secs}s",
                state.batch_index, progress.pending
            );
            suspend(&mut state, SuspendReason::Timeout, message);
            return state;
        }

        // Batch in progress.
        state.status = RolloutStatus::Active;
        state.reason = None;
        state.message = None;
        return state;
    }
}

/// Successes required to satisfy `threshold` over `selected` devices.
fn required_successes(threshold: Percentage, selected: usize) -> usize {
    (selected * threshold.0 as usize).div_ceil(100)
}

fn advance(state: &mut RolloutState, now: u64) {
    state.batch_index += 1;
    state.batch_succeeded = 0;
    state.batch_started_at = now;
    state.status = RolloutStatus::Active;
    state.reason = None;
    state.message = None;
}

fn suspend(state: &mut RolloutState, reason: SuspendReason, message: String) {
    state.status = RolloutStatus::Suspended;
    state.reason = Some(reason);
    state.message = Some(message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::plan;
    use edgefleet_core::{
        DeviceHealth, DeviceSelection, DeviceStatus, LabelSelector, RolloutPolicy, Template,
    };
    use std::collections::HashMap as Map;

    fn device(fingerprint: &str, rendered: u64, health: DeviceHealth) -> Device {
        Device {
            fingerprint: fingerprint.to_string(),
            owner: Some("edge-fleet".to_string()),
            labels: Map::new(),
            target_version: None,
            status: DeviceStatus {
                rendered_version: rendered,
                health,
                updating: false,
                last_seen: 1000,
            },
            resource_version: 1,
        }
    }

    fn select_all_policy(threshold: u8) -> RolloutPolicy {
        RolloutPolicy {
            selection: DeviceSelection::SelectAll,
            disruption_budget: None,
            success_threshold: Percentage(threshold),
            update_timeout_secs: 90,
        }
    }

    fn fleet(template_version: u64, resource_version: u64) -> Fleet {
        Fleet {
            name: "edge-fleet".to_string(),
            selector: LabelSelector::all(),
            template: Template {
                version: template_version,
                device_spec: serde_json::json!({}),
            },
            rollout: select_all_policy(100),
            resource_version,
        }
    }

    // ── observe_fleet ──────────────────────────────────────────────

    #[test]
    fn first_observation_enters_pending() {
        let state = observe_fleet(None, &fleet(2, 1), 1000);
        assert_eq!(state.status, RolloutStatus::Pending);
        assert_eq!(state.template_version, 2);
        assert_eq!(state.batch_index, 0);
    }

    #[test]
    fn unchanged_fleet_keeps_state() {
        let mut existing = RolloutState::pending("edge-fleet", 2, 1, 1000);
        existing.status = RolloutStatus::Active;
        existing.batch_index = 1;

        let state = observe_fleet(Some(existing.clone()), &fleet(2, 1), 2000);
        assert_eq!(state, existing);
    }

    #[test]
    fn template_bump_resets_to_batch_zero() {
        let mut existing = RolloutState::pending("edge-fleet", 2, 1, 1000);
        existing.status = RolloutStatus::Active;
        existing.batch_index = 1;

        let state = observe_fleet(Some(existing), &fleet(3, 2), 2000);
        assert_eq!(state.status, RolloutStatus::Pending);
        assert_eq!(state.template_version, 3);
        assert_eq!(state.batch_index, 0);
        assert_eq!(state.batch_started_at, 2000);
    }

    #[test]
    fn policy_edit_at_same_version_replans_from_zero() {
        let mut existing = RolloutState::pending("edge-fleet", 2, 1, 1000);
        existing.status = RolloutStatus::Active;
        existing.batch_index = 2;

        // Same template version, bumped fleet resource version.
        let state = observe_fleet(Some(existing), &fleet(2, 2), 2000);
        assert_eq!(state.batch_index, 0);
        assert_eq!(state.template_version, 2);
    }

    // ── evaluate ───────────────────────────────────────────────────

    fn eval(
        state: RolloutState,
        policy: &RolloutPolicy,
        devices: &[Device],
        now: u64,
    ) -> RolloutState {
        let plan = plan(policy, devices, state.template_version).unwrap();
        evaluate(
            state,
            &plan,
            devices,
            policy.update_timeout_secs,
            policy.success_threshold,
            now,
        )
    }

    #[test]
    fn pending_becomes_active_with_work_to_do() {
        let devices = vec![device("dev-1", 1, DeviceHealth::Healthy)];
        let state = RolloutState::pending("edge-fleet", 2, 1, 1000);

        let state = eval(state, &select_all_policy(100), &devices, 1000);
        assert_eq!(state.status, RolloutStatus::Active);
        assert_eq!(state.batch_index, 0);
    }

    #[test]
    fn all_converged_completes() {
        let devices = vec![
            device("dev-1", 2, DeviceHealth::Healthy),
            device("dev-2", 2, DeviceHealth::Healthy),
        ];
        let state = RolloutState::pending("edge-fleet", 2, 1, 1000);

        let state = eval(state, &select_all_policy(100), &devices, 1000);
        assert_eq!(state.status, RolloutStatus::Completed);
    }

    #[test]
    fn empty_fleet_completes_immediately() {
        let state = RolloutState::pending("edge-fleet", 2, 1, 1000);
        let state = eval(state, &select_all_policy(100), &[], 1000);
        assert_eq!(state.status, RolloutStatus::Completed);
    }

    /// Threshold gate: a batch never completes while successes fall short
    /// of its success threshold and all selected devices are terminal.
    #[test]
    fn unmet_threshold_suspends_once_all_terminal() {
        let devices = vec![
            device("dev-1", 2, DeviceHealth::Healthy),
            device("dev-2", 1, DeviceHealth::Unhealthy),
        ];
        let state = RolloutState::pending("edge-fleet", 2, 1, 1000);

        let state = eval(state, &select_all_policy(100), &devices, 1000);
        assert_eq!(state.status, RolloutStatus::Suspended);
        assert_eq!(state.reason, Some(SuspendReason::SuccessThresholdNotMet));
    }

    #[test]
    fn partial_threshold_tolerates_failures() {
        let devices = vec![
            device("dev-1", 2, DeviceHealth::Healthy),
            device("dev-2", 1, DeviceHealth::Unhealthy),
        ];
        let state = RolloutState::pending("edge-fleet", 2, 1, 1000);

        // 50% threshold: one success out of two is enough.
        let state = eval(state, &select_all_policy(50), &devices, 1000);
        assert_eq!(state.status, RolloutStatus::Completed);
    }

    #[test]
    fn timeout_suspends_stragglers() {
        let devices = vec![device("dev-1", 1, DeviceHealth::Healthy)];
        let state = RolloutState::pending("edge-fleet", 2, 1, 1000);
        let policy = select_all_policy(100);

        // Within the timeout: still active.
        let state = eval(state, &policy, &devices, 1050);
        assert_eq!(state.status, RolloutStatus::Active);

        // Past the 90s timeout: suspended.
        let state = eval(state, &policy, &devices, 1200);
        assert_eq!(state.status, RolloutStatus::Suspended);
        assert_eq!(state.reason, Some(SuspendReason::Timeout));
    }

    #[test]
    fn late_success_restarts_the_timeout_clock() {
        let mut devices = vec![
            device("dev-1", 1, DeviceHealth::Healthy),
            device("dev-2", 1, DeviceHealth::Healthy),
        ];
        let policy = select_all_policy(100);
        let state = RolloutState::pending("edge-fleet", 2, 1, 1000);

        let state = eval(state, &policy, &devices, 1000);
        assert_eq!(state.status, RolloutStatus::Active);

        // The first device converges only after the 90s window elapsed;
        // its success restarts the clock rather than leaving the batch
        // suspended while the second device waits.
        devices[0] = device("dev-1", 2, DeviceHealth::Healthy);
        let state = eval(state, &policy, &devices, 1120);
        assert_eq!(state.status, RolloutStatus::Active);

        // No further progress: the restarted clock runs out again.
        let state = eval(state, &policy, &devices, 1300);
        assert_eq!(state.status, RolloutStatus::Suspended);
        assert_eq!(state.reason, Some(SuspendReason::Timeout));
    }

    #[test]
    fn suspended_rollout_resumes_when_devices_recover() {
        let mut devices = vec![
            device("dev-1", 2, DeviceHealth::Healthy),
            device("dev-2", 1, DeviceHealth::Unhealthy),
        ];
        let state = RolloutState::pending("edge-fleet", 2, 1, 1000);
        let policy = select_all_policy(100);

        let state = eval(state, &policy, &devices, 1000);
        assert_eq!(state.status, RolloutStatus::Suspended);

        // The failed device recovers and converges; no operator action.
        devices[1] = device("dev-2", 2, DeviceHealth::Healthy);
        let state = eval(state, &policy, &devices, 1100);
        assert_eq!(state.status, RolloutStatus::Completed);
        assert_eq!(state.reason, None);
    }

    #[test]
    fn batch_index_is_monotonic_for_a_version() {
        let mut devices = vec![
            device("dev-1", 1, DeviceHealth::Healthy),
            device("dev-2", 1, DeviceHealth::Healthy),
        ];
        let policy = RolloutPolicy {
            selection: DeviceSelection::BatchSequence {
                sequence: vec![edgefleet_core::Batch {
                    selector: LabelSelector::all(),
                    limit: Some(edgefleet_core::BatchLimit::Absolute(1)),
                    success_threshold: None,
                }],
            },
            disruption_budget: None,
            success_threshold: Percentage(100),
            update_timeout_secs: 90,
        };
        let state = RolloutState::pending("edge-fleet", 2, 1, 1000);

        let state = eval(state, &policy, &devices, 1000);
        assert_eq!(state.batch_index, 0);

        // First batch device converges: index moves forward.
        devices[0] = device("dev-1", 2, DeviceHealth::Healthy);
        let state = eval(state, &policy, &devices, 1010);
        assert!(state.batch_index >= 1);
        let index = state.batch_index;

        // Re-evaluating the same snapshot never moves it back.
        let state = eval(state, &policy, &devices, 1020);
        assert!(state.batch_index >= index);
    }

    #[test]
    fn completed_state_is_terminal() {
        let devices = vec![device("dev-1", 1, DeviceHealth::Unhealthy)];
        let mut state = RolloutState::pending("edge-fleet", 2, 1, 1000);
        state.status = RolloutStatus::Completed;

        // Even with an unhealthy snapshot, completed stays completed.
        let state = eval(state, &select_all_policy(100), &devices, 2000);
        assert_eq!(state.status, RolloutStatus::Completed);
    }

    #[test]
    fn overall_threshold_gates_final_completion() {
        // Per-batch threshold 50% lets the batch advance with one failure,
        // but the 100% overall threshold holds completion back.
        let devices = vec![
            device("dev-1", 2, DeviceHealth::Healthy),
            device("dev-2", 1, DeviceHealth::Unhealthy),
        ];
        let policy = RolloutPolicy {
            selection: DeviceSelection::BatchSequence {
                sequence: vec![edgefleet_core::Batch {
                    selector: LabelSelector::all(),
                    limit: None,
                    success_threshold: Some(Percentage(50)),
                }],
            },
            disruption_budget: None,
            success_threshold: Percentage(100),
            update_timeout_secs: 90,
        };
        let state = RolloutState::pending("edge-fleet", 2, 1, 1000);

        let state = eval(state, &policy, &devices, 1000);
        assert_eq!(state.status, RolloutStatus::Suspended);
        assert_eq!(state.reason, Some(SuspendReason::SuccessThresholdNotMet));
        assert!(state.message.as_deref().unwrap_or("").starts_with("fleet:"));
    }

    #[test]
    fn batch_progress_tallies_terminal_states() {
        let devices = vec![
            device("dev-1", 2, DeviceHealth::Healthy),
            device("dev-2", 1, DeviceHealth::Unhealthy),
            device("dev-3", 1, DeviceHealth::Healthy),
        ];
        let batch = PlannedBatch {
            devices: vec![
                "dev-1".to_string(),
                "dev-2".to_string(),
                "dev-3".to_string(),
                "dev-gone".to_string(),
            ],
            success_threshold: Percentage(100),
        };

        let progress = batch_progress(&batch, &devices, 2);
        assert_eq!(progress.selected, 4);
        assert_eq!(progress.succeeded, 1);
        assert_eq!(progress.failed, 1);
        assert_eq!(progress.pending, 2);
    }
}
