//! redb table definitions for the EdgeFleet state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Device keys are enrollment fingerprints; redb iterates keys in
//! sorted order, which gives the planner its stable device ordering for free.

use redb::TableDefinition;

/// Devices keyed by `{fingerprint}`.
pub const DEVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("devices");

/// Fleets keyed by `{name}`.
pub const FLEETS: TableDefinition<&str, &[u8]> = TableDefinition::new("fleets");

/// Rollout progress keyed by `{fleet_name}`.
pub const ROLLOUTS: TableDefinition<&str, &[u8]> = TableDefinition::new("rollouts");
