//! Disruption guard — admits batch candidates subject to the fleet's
//! disruption budget.
//!
//! Devices are partitioned into groups keyed by the label values named in
//! `group_by` (empty `group_by` means one global group). A candidate is
//! admitted only if taking it down keeps the group within
//! `max_unavailable` and above `min_available`. Denial is not an error:
//! it is a normal "not yet" outcome re-evaluated on the next tick.

use std::collections::HashMap;

use edgefleet_core::{Device, DeviceId, DisruptionBudget};

/// Outcome of one admission pass, in candidate order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Admission {
    pub admitted: Vec<DeviceId>,
    pub denied: Vec<DeviceId>,
}

/// Per-group availability accounting.
#[derive(Default)]
struct GroupStat {
    unavailable: u32,
    available: u32,
}

/// Evaluate candidates against the disruption budget.
///
/// `population` is the whole fleet snapshot; devices that are mid-update
/// or reported unhealthy already count against their group's budget.
/// Candidates are processed in the order given (the planner's stable
/// device ordering), so results are reproducible for identical inputs.
pub fn admit(
    candidates: &[Device],
    population: &[Device],
    budget: Option<&DisruptionBudget>,
) -> Admission {
    let Some(budget) = budget else {
        return Admission {
            admitted: candidates.iter().map(|d| d.fingerprint.clone()).collect(),
            denied: Vec::new(),
        };
    };

    let mut groups: HashMap<String, GroupStat> = HashMap::new();
    for device in population {
        let stat = groups.entry(group_key(device, &budget.group_by)).or_default();
        if device.unavailable() {
            stat.unavailable += 1;
        } else {
            stat.available += 1;
        }
    }

    let mut admission = Admission::default();
    for candidate in candidates {
        let stat = groups
            .entry(group_key(candidate, &budget.group_by))
            .or_default();

        // Already unavailable devices are counted above; re-admitting one
        // consumes no additional budget.
        if candidate.unavailable() {
            admission.admitted.push(candidate.fingerprint.clone());
            continue;
        }

        let within_max = budget
            .max_unavailable
            .is_none_or(|max| stat.unavailable + 1 <= max);
        let within_min = budget
            .min_available
            .is_none_or(|min| stat.available.saturating_sub(1) >= min);

        if within_max && within_min {
            stat.unavailable += 1;
            stat.available = stat.available.saturating_sub(1);
            admission.admitted.push(candidate.fingerprint.clone());
        } else {
            admission.denied.push(candidate.fingerprint.clone());
        }
    }
    admission
}

/// Concatenated label values for the group-by keys. Devices missing a
/// key fall into the group with an empty value for it.
fn group_key(device: &Device, group_by: &[String]) -> String {
    group_by
        .iter()
        .map(|key| device.labels.get(key).map(String::as_str).unwrap_or(""))
        .collect::<Vec<_>>()
        .join("/")
}
