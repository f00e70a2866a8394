//! edgefleet-rollout — drives fleets toward their desired template version.
//!
//! The rollout core is a per-fleet control loop built from pure parts:
//!
//! - [`planner`] computes the ordered batch sequence from the rollout
//!   policy and a live device snapshot.
//! - [`budget`] admits batch candidates subject to the disruption budget.
//! - [`machine`] is the rollout state machine
//!   (`Pending → Active ⇄ Suspended → Completed`).
//! - [`driver`] ties them together: one event-coalescing loop per fleet
//!   that re-plans on every device report, fleet write, and timer tick.
//!
//! Planning and admission are pure functions of persisted state plus the
//! device snapshot, so re-running a pass after a crash converges to the
//! same admitted set.

pub mod budget;
pub mod driver;
pub mod error;
pub mod machine;
pub mod planner;

pub use budget::{Admission, admit};
pub use driver::{FleetEvent, RolloutDriver};
pub use error::{DriverError, DriverResult};
pub use machine::{BatchProgress, evaluate, observe_fleet};
pub use planner::{PlannedBatch, RolloutPlan, plan};
