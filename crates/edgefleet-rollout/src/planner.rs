//! Batch planner — resolves a rollout policy into concrete device batches.
//!
//! Planning is a pure function of `(policy, device snapshot, template
//! version)`. Selectors are logical: membership is resolved against the
//! current snapshot on every pass, so devices that change labels between
//! passes can move in or out of a not-yet-started batch. Membership
//! depends only on labels and stable fingerprint ordering, never on
//! convergence, so a batch resolves to the same devices before and after
//! its members converge and the batch index walks forward one batch at a
//! time. Convergence is tallied during evaluation: devices already on the
//! target version count as satisfied, and the driver never re-issues
//! their update.

use std::collections::HashSet;

use edgefleet_core::{
    Batch, Device, DeviceId, DeviceSelection, Percentage, PolicyError, RolloutPolicy,
    TemplateVersion,
};

/// One planned stage: the concrete device set resolved for a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedBatch {
    /// Selected device fingerprints, in stable fingerprint order.
    pub devices: Vec<DeviceId>,
    /// Effective completion threshold (per-batch, falling back to the
    /// policy-wide threshold).
    pub success_threshold: Percentage,
}

impl PlannedBatch {
    /// An empty batch is auto-skipped: treated as immediately satisfied.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// The full planned sequence for one template version.
#[derive(Debug, Clone, PartialEq)]
pub struct RolloutPlan {
    pub template_version: TemplateVersion,
    /// Explicit batches in policy order, plus a trailing implicit
    /// remainder batch for explicit sequences. Empty batches keep their
    /// index so batch numbering is stable across evaluations.
    pub batches: Vec<PlannedBatch>,
}

impl RolloutPlan {
    /// Total devices selected across all batches.
    pub fn total_selected(&self) -> usize {
        self.batches.iter().map(|b| b.devices.len()).sum()
    }

    pub fn batch(&self, index: usize) -> Option<&PlannedBatch> {
        self.batches.get(index)
    }
}

/// Compute the batch sequence for a fleet.
///
/// Fails fast on a structurally invalid policy; the caller marks the
/// rollout suspended with a configuration-error reason and does not retry
/// until a corrected policy is written.
pub fn plan(
    policy: &RolloutPolicy,
    devices: &[Device],
    template_version: TemplateVersion,
) -> Result<RolloutPlan, PolicyError> {
    policy.validate()?;

    // Stable device ordering: admission results must be reproducible
    // given the same inputs.
    let mut population: Vec<&Device> = devices.iter().collect();
    population.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));

    let batches = match &policy.selection {
        DeviceSelection::SelectAll => {
            vec![PlannedBatch {
                devices: population.iter().map(|d| d.fingerprint.clone()).collect(),
                success_threshold: policy.success_threshold,
            }]
        }
        DeviceSelection::BatchSequence { sequence } => {
            plan_sequence(sequence, &population, policy.success_threshold)
        }
    };

    Ok(RolloutPlan {
        template_version,
        batches,
    })
}

/// Resolve an explicit batch sequence, then append the implicit remainder
/// batch covering every device no explicit batch admitted.
fn plan_sequence(
    sequence: &[Batch],
    population: &[&Device],
    default_threshold: Percentage,
) -> Vec<PlannedBatch> {
    // Indices into `population` already taken by an earlier batch.
    let mut admitted: HashSet<usize> = HashSet::new();
    let mut batches = Vec::with_capacity(sequence.len() + 1);

    for batch in sequence {
        let matched: Vec<usize> = population
            .iter()
            .enumerate()
            .filter(|(i, d)| !admitted.contains(i) && batch.selector.matches(&d.labels))
            .map(|(i, _)| i)
            .collect();

        let take = match &batch.limit {
            Some(limit) => limit.resolve(matched.len()),
            None => matched.len(),
        };

        let mut selected = Vec::with_capacity(take);
        for &i in matched.iter().take(take) {
            admitted.insert(i);
            selected.push(population[i].fingerprint.clone());
        }

        batches.push(PlannedBatch {
            devices: selected,
            success_threshold: batch.success_threshold.unwrap_or(default_threshold),
        });
    }

    // Implicit remainder batch.
    let remainder: Vec<DeviceId> = population
        .iter()
        .enumerate()
        .filter(|(i, _)| !admitted.contains(i))
        .map(|(_, d)| d.fingerprint.clone())
        .collect();
    batches.push(PlannedBatch {
        devices: remainder,
        success_threshold: default_threshold,
    });

    batches
}
