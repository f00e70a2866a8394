//! Domain types for the EdgeFleet control plane.
//!
//! Devices carry a mutable label set and a self-reported status; fleets
//! carry a versioned template (the desired device spec) and a rollout
//! policy describing how devices converge to a new template version.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::PolicyError;
use crate::selector::LabelSelector;

/// Unique device identity (enrollment fingerprint).
pub type DeviceId = String;

/// Unique fleet name within an organization.
pub type FleetId = String;

/// Monotonic identifier of a fleet's desired device configuration.
pub type TemplateVersion = u64;

// ── Device ─────────────────────────────────────────────────────────

/// A managed edge device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Device {
    pub fingerprint: DeviceId,
    /// Owning fleet, if the device has been adopted by one.
    pub owner: Option<FleetId>,
    /// Operator- or fleet-managed labels used for batch selection.
    pub labels: HashMap<String, String>,
    /// Desired template version, written by the rollout driver.
    pub target_version: Option<TemplateVersion>,
    /// Status reported by the device itself.
    pub status: DeviceStatus,
    /// Optimistic-concurrency token, bumped on every write.
    pub resource_version: u64,
}

/// Self-reported device status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceStatus {
    /// Template version the device currently renders.
    pub rendered_version: TemplateVersion,
    pub health: DeviceHealth,
    /// True while the device is applying an update.
    pub updating: bool,
    /// Unix timestamp (seconds) of the last status report.
    pub last_seen: u64,
}

/// Application health as reported by the device agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceHealth {
    Healthy,
    Unhealthy,
    Unknown,
}

impl Device {
    /// True once the device has applied `version` and reports healthy.
    pub fn converged_to(&self, version: TemplateVersion) -> bool {
        self.status.rendered_version == version && self.status.health == DeviceHealth::Healthy
    }

    /// True while the device counts against a disruption budget:
    /// mid-update or reported unhealthy.
    pub fn unavailable(&self) -> bool {
        self.status.updating || self.status.health == DeviceHealth::Unhealthy
    }
}

// ── Fleet ──────────────────────────────────────────────────────────

/// A fleet: a selector over devices plus the desired configuration and
/// the policy for rolling it out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fleet {
    pub name: FleetId,
    /// Devices matching this selector belong to the fleet.
    pub selector: LabelSelector,
    pub template: Template,
    pub rollout: RolloutPolicy,
    /// Optimistic-concurrency token, bumped on every write.
    pub resource_version: u64,
}

/// Desired device configuration. Bumping `version` starts a new rollout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Template {
    pub version: TemplateVersion,
    /// Opaque desired device spec, passed through to devices.
    pub device_spec: serde_json::Value,
}

// ── Rollout policy ─────────────────────────────────────────────────

/// How a fleet's devices are moved to a new template version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RolloutPolicy {
    pub selection: DeviceSelection,
    pub disruption_budget: Option<DisruptionBudget>,
    /// Fraction of the whole fleet that must converge for the rollout to
    /// complete.
    pub success_threshold: Percentage,
    /// Seconds a batch may run before unresponsive devices count as failed.
    pub update_timeout_secs: u64,
}

/// Device-selection strategy for a rollout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum DeviceSelection {
    /// One implicit batch covering the whole fleet.
    SelectAll,
    /// Ordered sequence of explicitly selected batches. Devices not
    /// covered by any batch form a trailing implicit remainder batch.
    BatchSequence { sequence: Vec<Batch> },
}

/// One stage of a batch sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Batch {
    pub selector: LabelSelector,
    /// Cap on how many matched devices this batch takes. `None` takes all.
    pub limit: Option<BatchLimit>,
    /// Per-batch completion threshold; falls back to the policy threshold.
    pub success_threshold: Option<Percentage>,
}

/// Batch size limit: an absolute device count or a percentage of the
/// matched devices still remaining at this point in the sequence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum BatchLimit {
    Absolute(u32),
    Percent(Percentage),
}

impl BatchLimit {
    /// Resolve the limit against the remaining matched-device count.
    /// Percentages round up, so a non-empty remainder always yields at
    /// least one device.
    pub fn resolve(&self, remaining: usize) -> usize {
        match self {
            BatchLimit::Absolute(n) => (*n as usize).min(remaining),
            BatchLimit::Percent(p) => (remaining * p.0 as usize).div_ceil(100),
        }
    }
}

/// Cap on simultaneously unavailable devices during a rollout.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DisruptionBudget {
    pub max_unavailable: Option<u32>,
    pub min_available: Option<u32>,
    /// Label keys partitioning the fleet into independently budgeted
    /// groups. Empty means one global group.
    #[serde(default)]
    pub group_by: Vec<String>,
}

/// Whole percentage in `0..=100`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Percentage(pub u8);

impl Percentage {
    pub fn fraction(&self) -> f64 {
        f64::from(self.0) / 100.0
    }
}

impl RolloutPolicy {
    /// Reject structurally invalid policies before planning.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.success_threshold.0 > 100 {
            return Err(PolicyError::InvalidSuccessThreshold {
                percent: self.success_threshold.0,
            });
        }
        if let Some(budget) = &self.disruption_budget
            && budget.max_unavailable == Some(0)
        {
            return Err(PolicyError::ZeroMaxUnavailable);
        }
        if let DeviceSelection::BatchSequence { sequence } = &self.selection {
            if sequence.is_empty() {
                return Err(PolicyError::EmptyBatchSequence);
            }
            for (i, batch) in sequence.iter().enumerate() {
                match batch.limit {
                    Some(BatchLimit::Absolute(0)) => {
                        return Err(PolicyError::ZeroBatchLimit { batch: i });
                    }
                    Some(BatchLimit::Percent(p)) if p.0 == 0 || p.0 > 100 => {
                        return Err(PolicyError::InvalidPercentLimit {
                            batch: i,
                            percent: p.0,
                        });
                    }
                    _ => {}
                }
                if let Some(threshold) = batch.success_threshold
                    && threshold.0 > 100
                {
                    return Err(PolicyError::InvalidBatchThreshold {
                        batch: i,
                        percent: threshold.0,
                    });
                }
            }
        }
        Ok(())
    }
}

// ── Rollout state ──────────────────────────────────────────────────

/// Per-fleet rollout progress, persisted between evaluations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RolloutState {
    pub fleet: FleetId,
    pub template_version: TemplateVersion,
    /// Fleet resource version this rollout was planned against. A fleet
    /// write (template bump or policy edit) restarts planning from batch 0.
    pub fleet_revision: u64,
    /// Index into the planned batch sequence. Only moves forward for a
    /// given template version; a version bump resets it to zero.
    pub batch_index: usize,
    /// Converged-device high-water mark for the current batch. A new
    /// success restarts the update-timeout clock.
    pub batch_succeeded: usize,
    pub status: RolloutStatus,
    pub reason: Option<SuspendReason>,
    pub message: Option<String>,
    /// Unix timestamp (seconds) when the current batch started admitting.
    pub batch_started_at: u64,
}

/// Rollout lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStatus {
    Pending,
    Active,
    Suspended,
    Completed,
}

/// Why a rollout is suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspendReason {
    ConfigurationError,
    SuccessThresholdNotMet,
    Timeout,
}

impl RolloutState {
    /// Fresh state for a template version, entered before any batch runs.
    pub fn pending(
        fleet: &str,
        template_version: TemplateVersion,
        fleet_revision: u64,
        now: u64,
    ) -> Self {
        Self {
            fleet: fleet.to_string(),
            template_version,
            fleet_revision,
            batch_index: 0,
            batch_succeeded: 0,
            status: RolloutStatus::Pending,
            reason: None,
            message: None,
            batch_started_at: now,
        }
    }

    /// Operator-facing condition derived from this state.
    pub fn condition(&self) -> RolloutCondition {
        let (status, reason) = match self.status {
            RolloutStatus::Pending => (ConditionStatus::True, "RolloutPending"),
            RolloutStatus::Active => (ConditionStatus::True, "RolloutActive"),
            RolloutStatus::Suspended => (ConditionStatus::False, "RolloutSuspended"),
            RolloutStatus::Completed => (ConditionStatus::True, "RolloutCompleted"),
        };
        RolloutCondition {
            status,
            reason: reason.to_string(),
            message: self.message.clone().unwrap_or_default(),
            batch_index: self.batch_index,
        }
    }
}

/// Machine-readable rollout condition exposed to operator APIs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RolloutCondition {
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub batch_index: usize,
}

/// Condition polarity: `True` while the rollout is progressing or done,
/// `False` while it is suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionStatus {
    True,
    False,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_with_sequence(sequence: Vec<Batch>) -> RolloutPolicy {
        RolloutPolicy {
            selection: DeviceSelection::BatchSequence { sequence },
            disruption_budget: None,
            success_threshold: Percentage(100),
            update_timeout_secs: 90,
        }
    }

    fn batch(limit: Option<BatchLimit>) -> Batch {
        Batch {
            selector: LabelSelector::all(),
            limit,
            success_threshold: None,
        }
    }

    // ── Limit resolution ───────────────────────────────────────────

    #[test]
    fn absolute_limit_caps_at_remaining() {
        assert_eq!(BatchLimit::Absolute(3).resolve(10), 3);
        assert_eq!(BatchLimit::Absolute(3).resolve(2), 2);
        assert_eq!(BatchLimit::Absolute(3).resolve(0), 0);
    }

    #[test]
    fn percent_limit_rounds_up() {
        assert_eq!(BatchLimit::Percent(Percentage(50)).resolve(2), 1);
        assert_eq!(BatchLimit::Percent(Percentage(50)).resolve(3), 2);
        assert_eq!(BatchLimit::Percent(Percentage(1)).resolve(1), 1);
        assert_eq!(BatchLimit::Percent(Percentage(100)).resolve(7), 7);
        assert_eq!(BatchLimit::Percent(Percentage(50)).resolve(0), 0);
    }

    // ── Policy validation ──────────────────────────────────────────

    #[test]
    fn select_all_policy_is_valid() {
        let policy = RolloutPolicy {
            selection: DeviceSelection::SelectAll,
            disruption_budget: None,
            success_threshold: Percentage(90),
            update_timeout_secs: 90,
        };
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn zero_absolute_limit_is_rejected() {
        let policy = policy_with_sequence(vec![batch(Some(BatchLimit::Absolute(0)))]);
        assert_eq!(
            policy.validate(),
            Err(PolicyError::ZeroBatchLimit { batch: 0 })
        );
    }

    #[test]
    fn out_of_range_percent_limit_is_rejected() {
        let policy = policy_with_sequence(vec![
            batch(Some(BatchLimit::Absolute(1))),
            batch(Some(BatchLimit::Percent(Percentage(150)))),
        ]);
        assert_eq!(
            policy.validate(),
            Err(PolicyError::InvalidPercentLimit {
                batch: 1,
                percent: 150
            })
        );
    }

    #[test]
    fn empty_sequence_is_rejected() {
        let policy = policy_with_sequence(vec![]);
        assert_eq!(policy.validate(), Err(PolicyError::EmptyBatchSequence));
    }

    #[test]
    fn zero_max_unavailable_is_rejected() {
        let mut policy = policy_with_sequence(vec![batch(None)]);
        policy.disruption_budget = Some(DisruptionBudget {
            max_unavailable: Some(0),
            min_available: None,
            group_by: vec![],
        });
        assert_eq!(policy.validate(), Err(PolicyError::ZeroMaxUnavailable));
    }

    // ── Device predicates ──────────────────────────────────────────

    fn device(rendered: u64, health: DeviceHealth, updating: bool) -> Device {
        Device {
            fingerprint: "dev-1".to_string(),
            owner: Some("fleet-1".to_string()),
            labels: HashMap::new(),
            target_version: None,
            status: DeviceStatus {
                rendered_version: rendered,
                health,
                updating,
                last_seen: 1000,
            },
            resource_version: 1,
        }
    }

    #[test]
    fn convergence_requires_version_and_health() {
        assert!(device(3, DeviceHealth::Healthy, false).converged_to(3));
        assert!(!device(2, DeviceHealth::Healthy, false).converged_to(3));
        assert!(!device(3, DeviceHealth::Unhealthy, false).converged_to(3));
        assert!(!device(3, DeviceHealth::Unknown, false).converged_to(3));
    }

    #[test]
    fn unavailable_while_updating_or_unhealthy() {
        assert!(device(3, DeviceHealth::Healthy, true).unavailable());
        assert!(device(3, DeviceHealth::Unhealthy, false).unavailable());
        assert!(!device(3, DeviceHealth::Healthy, false).unavailable());
    }

    // ── Conditions ─────────────────────────────────────────────────

    #[test]
    fn suspended_state_yields_false_condition() {
        let mut state = RolloutState::pending("fleet-1", 2, 1, 1000);
        state.status = RolloutStatus::Suspended;
        state.reason = Some(SuspendReason::SuccessThresholdNotMet);
        state.message = Some("batch 1: 0/1 devices converged".to_string());

        let cond = state.condition();
        assert_eq!(cond.status, ConditionStatus::False);
        assert_eq!(cond.reason, "RolloutSuspended");
        assert!(cond.message.contains("converged"));
    }

    #[test]
    fn active_state_yields_true_condition() {
        let mut state = RolloutState::pending("fleet-1", 2, 1, 1000);
        state.status = RolloutStatus::Active;
        state.batch_index = 1;

        let cond = state.condition();
        assert_eq!(cond.status, ConditionStatus::True);
        assert_eq!(cond.reason, "RolloutActive");
        assert_eq!(cond.batch_index, 1);
    }
}
