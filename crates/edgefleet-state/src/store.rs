//! StateStore — redb-backed persistence for devices, fleets, and rollout
//! progress.
//!
//! Provides typed CRUD operations plus the two check-and-set writes the
//! rollout driver depends on: setting a device's target version and
//! accepting a device status report. All values are JSON-serialized into
//! redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use edgefleet_core::{Device, DeviceStatus, Fleet, LabelSelector, RolloutState, TemplateVersion};

use crate::error::{StateError, StateResult};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(DEVICES).map_err(map_err!(Table))?;
        txn.open_table(FLEETS).map_err(map_err!(Table))?;
        txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Devices ────────────────────────────────────────────────────

    /// Insert or update a device, bumping its resource version.
    /// Returns the new resource version.
    pub fn put_device(&self, device: &Device) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let new_version;
        {
            let mut table = txn.open_table(DEVICES).map_err(map_err!(Table))?;
            let current = match table
                .get(device.fingerprint.as_str())
                .map_err(map_err!(Read))?
            {
                Some(guard) => {
                    let existing: Device =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    existing.resource_version
                }
                None => 0,
            };
            new_version = current + 1;
            let mut stored = device.clone();
            stored.resource_version = new_version;
            let value = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;
            table
                .insert(device.fingerprint.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(device = %device.fingerprint, resource_version = new_version, "device stored");
        Ok(new_version)
    }

    /// Get a device by fingerprint.
    pub fn get_device(&self, fingerprint: &str) -> StateResult<Option<Device>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEVICES).map_err(map_err!(Table))?;
        match table.get(fingerprint).map_err(map_err!(Read))? {
            Some(guard) => {
                let device: Device =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(device))
            }
            None => Ok(None),
        }
    }

    /// List devices, optionally filtered by owner fleet and label selector.
    ///
    /// Results come back in fingerprint order (redb key order), which is
    /// the stable ordering the batch planner relies on.
    pub fn list_devices(
        &self,
        owner: Option<&str>,
        selector: Option<&LabelSelector>,
    ) -> StateResult<Vec<Device>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEVICES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let device: Device =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if let Some(owner) = owner
                && device.owner.as_deref() != Some(owner)
            {
                continue;
            }
            if let Some(selector) = selector
                && !selector.matches(&device.labels)
            {
                continue;
            }
            results.push(device);
        }
        Ok(results)
    }

    /// Delete a device by fingerprint. Returns true if it existed.
    pub fn delete_device(&self, fingerprint: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(DEVICES).map_err(map_err!(Table))?;
            existed = table.remove(fingerprint).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(device = %fingerprint, existed, "device deleted");
        Ok(existed)
    }

    /// Write the desired template version onto a device, check-and-set.
    ///
    /// Fails with [`StateError::Conflict`] if the device's resource version
    /// no longer matches `expected_version` — the caller read a stale
    /// snapshot and must re-plan. On success the device is marked updating
    /// and its resource version is bumped.
    pub fn set_device_target_version(
        &self,
        fingerprint: &str,
        version: TemplateVersion,
        expected_version: u64,
    ) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DEVICES).map_err(map_err!(Table))?;
            let mut device: Device = match table.get(fingerprint).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StateError::NotFound(format!("device {fingerprint}"))),
            };
            if device.resource_version != expected_version {
                return Err(StateError::Conflict {
                    resource: format!("device {fingerprint}"),
                    expected: expected_version,
                    actual: device.resource_version,
                });
            }
            device.target_version = Some(version);
            device.status.updating = true;
            device.resource_version += 1;
            let value = serde_json::to_vec(&device).map_err(map_err!(Serialize))?;
            table
                .insert(fingerprint, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(device = %fingerprint, version, "device target version set");
        Ok(())
    }

    /// Apply a device's own status report. Only the status block changes;
    /// spec fields stay as written by operators and the driver.
    pub fn report_device_status(
        &self,
        fingerprint: &str,
        status: DeviceStatus,
    ) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DEVICES).map_err(map_err!(Table))?;
            let mut device: Device = match table.get(fingerprint).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StateError::NotFound(format!("device {fingerprint}"))),
            };
            device.status = status;
            device.resource_version += 1;
            let value = serde_json::to_vec(&device).map_err(map_err!(Serialize))?;
            table
                .insert(fingerprint, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Fleets ─────────────────────────────────────────────────────

    /// Insert or update a fleet, bumping its resource version.
    /// Returns the new resource version.
    pub fn put_fleet(&self, fleet: &Fleet) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let new_version;
        {
            let mut table = txn.open_table(FLEETS).map_err(map_err!(Table))?;
            let current = match table.get(fleet.name.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    let existing: Fleet =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    existing.resource_version
                }
                None => 0,
            };
            new_version = current + 1;
            let mut stored = fleet.clone();
            stored.resource_version = new_version;
            let value = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;
            table
                .insert(fleet.name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(fleet = %fleet.name, resource_version = new_version, "fleet stored");
        Ok(new_version)
    }

    /// Get a fleet by name.
    pub fn get_fleet(&self, name: &str) -> StateResult<Option<Fleet>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(FLEETS).map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => {
                let fleet: Fleet =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(fleet))
            }
            None => Ok(None),
        }
    }

    /// List all fleets.
    pub fn list_fleets(&self) -> StateResult<Vec<Fleet>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(FLEETS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let fleet: Fleet =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(fleet);
        }
        Ok(results)
    }

    /// Delete a fleet and its rollout state. Returns true if it existed.
    pub fn delete_fleet(&self, name: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut fleets = txn.open_table(FLEETS).map_err(map_err!(Table))?;
            existed = fleets.remove(name).map_err(map_err!(Write))?.is_some();
            let mut rollouts = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            rollouts.remove(name).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(fleet = %name, existed, "fleet deleted");
        Ok(existed)
    }

    // ── Rollout states ─────────────────────────────────────────────

    /// Persist rollout progress for a fleet.
    pub fn put_rollout_state(&self, state: &RolloutState) -> StateResult<()> {
        let value = serde_json::to_vec(state).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            table
                .insert(state.fleet.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get rollout progress for a fleet.
    pub fn get_rollout_state(&self, fleet: &str) -> StateResult<Option<RolloutState>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        match table.get(fleet).map_err(map_err!(Read))? {
            Some(guard) => {
                let state: RolloutState =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    /// Delete rollout progress for a fleet. Returns true if it existed.
    pub fn delete_rollout_state(&self, fleet: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            existed = table.remove(fleet).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }
}
