//! edgefleet-core — domain types for the EdgeFleet control plane.
//!
//! Defines the device, fleet, and rollout-policy resources shared by the
//! store and the rollout core, plus label-selector matching. All types are
//! serializable to/from JSON for persistence in redb tables.

pub mod error;
pub mod selector;
pub mod types;

pub use error::PolicyError;
pub use selector::LabelSelector;
pub use types::*;
