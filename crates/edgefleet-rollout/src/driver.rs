//! Per-fleet rollout driver.
//!
//! One driver loop runs per fleet. Events (device status reports, fleet
//! writes, timer ticks) are coalesced: the loop drains whatever queued up
//! and runs a single reconcile pass. Each pass re-reads everything from
//! the store, so a crash between passes loses nothing — the next pass
//! recomputes the same plan and admitted set from persisted state.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use edgefleet_core::{Device, RolloutCondition, RolloutState, RolloutStatus, SuspendReason};
use edgefleet_state::StateStore;

use crate::error::DriverResult;
use crate::{budget, machine, planner};

/// Wake-up reasons for a fleet's driver loop. The loop treats them all
/// identically; the variants exist so senders say why they poked it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FleetEvent {
    /// A device owned by (or matching) the fleet reported status.
    DeviceReport,
    /// The fleet spec was written.
    FleetChanged,
    /// Periodic timer, so timeouts fire without traffic.
    Tick,
}

/// Event channel depth per fleet. Reconciles coalesce, so a shallow
/// buffer is enough; a full channel just drops the redundant wake-up.
const EVENT_BUFFER: usize = 32;

/// Passes retried within one reconcile when a check-and-set write loses
/// a race. Further conflicts wait for the next event or tick.
const CONFLICT_RETRIES: usize = 3;

/// Drives a single fleet's rollout against the state store.
#[derive(Clone)]
pub struct RolloutDriver {
    store: StateStore,
}

impl RolloutDriver {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Run one reconcile for the fleet at the current wall-clock time.
    pub fn reconcile(&self, fleet: &str) -> DriverResult<Option<RolloutCondition>> {
        self.reconcile_at(fleet, epoch_secs())
    }

    /// Run one reconcile with an explicit timestamp (tests control time).
    ///
    /// Retries a bounded number of times when a device write conflicts
    /// with a concurrent status report; persistent contention is left for
    /// the next tick rather than looped on.
    pub fn reconcile_at(&self, fleet: &str, now: u64) -> DriverResult<Option<RolloutCondition>> {
        let mut last_conflict = None;
        for _ in 0..CONFLICT_RETRIES {
            match self.reconcile_pass(fleet, now) {
                Err(e) if e.is_conflict() => {
                    debug!(%fleet, error = %e, "reconcile lost a write race, retrying");
                    last_conflict = Some(e);
                }
                other => return other,
            }
        }
        let e = last_conflict.unwrap();
        warn!(%fleet, error = %e, "reconcile still conflicting, deferring to next tick");
        Err(e)
    }

    fn reconcile_pass(&self, fleet_name: &str, now: u64) -> DriverResult<Option<RolloutCondition>> {
        let Some(fleet) = self.store.get_fleet(fleet_name)? else {
            // Fleet deleted: drop any leftover progress.
            if self.store.delete_rollout_state(fleet_name)? {
                info!(fleet = %fleet_name, "fleet gone, rollout state removed");
            }
            return Ok(None);
        };

        self.adopt_matching_devices(&fleet)?;
        let devices = self.store.list_devices(Some(&fleet.name), None)?;

        let previous = self.store.get_rollout_state(&fleet.name)?;
        let state = machine::observe_fleet(previous.clone(), &fleet, now);

        let plan = match planner::plan(&fleet.rollout, &devices, fleet.template.version) {
            Ok(plan) => plan,
            Err(e) => {
                // Invalid policy: fail fast before any device is touched.
                let mut state = state;
                state.status = RolloutStatus::Suspended;
                state.reason = Some(SuspendReason::ConfigurationError);
                state.message = Some(e.to_string());
                warn!(fleet = %fleet.name, error = %e, "rollout policy rejected");
                self.persist(previous.as_ref(), &state)?;
                return Ok(Some(state.condition()));
            }
        };

        let state = machine::evaluate(
            state,
            &plan,
            &devices,
            fleet.rollout.update_timeout_secs,
            fleet.rollout.success_threshold,
            now,
        );

        if state.status == RolloutStatus::Active
            && let Some(batch) = plan.batch(state.batch_index)
        {
            // Converged devices stay in the batch for progress counting
            // but are never re-issued their update.
            let candidates: Vec<Device> = batch
                .devices
                .iter()
                .filter_map(|id| devices.iter().find(|d| &d.fingerprint == id))
                .filter(|d| {
                    d.target_version != Some(fleet.template.version)
                        && !d.converged_to(fleet.template.version)
                })
                .cloned()
                .collect();

            let admission = budget::admit(
                &candidates,
                &devices,
                fleet.rollout.disruption_budget.as_ref(),
            );
            for device in candidates
                .iter()
                .filter(|d| admission.admitted.contains(&d.fingerprint))
            {
                self.store.set_device_target_version(
                    &device.fingerprint,
                    fleet.template.version,
                    device.resource_version,
                )?;
            }
            if !admission.admitted.is_empty() {
                info!(
                    fleet = %fleet.name,
                    batch = state.batch_index,
                    version = fleet.template.version,
                    issued = admission.admitted.len(),
                    "update issued to batch devices"
                );
            }
            if !admission.denied.is_empty() {
                debug!(
                    fleet = %fleet.name,
                    batch = state.batch_index,
                    held = admission.denied.len(),
                    "devices held back by disruption budget"
                );
            }
        }

        self.persist(previous.as_ref(), &state)?;
        Ok(Some(state.condition()))
    }

    /// Adopt unowned devices whose labels match the fleet selector.
    fn adopt_matching_devices(&self, fleet: &edgefleet_core::Fleet) -> DriverResult<()> {
        let matching = self.store.list_devices(None, Some(&fleet.selector))?;
        for device in matching {
            if device.owner.is_none() {
                let mut adopted = device;
                adopted.owner = Some(fleet.name.clone());
                self.store.put_device(&adopted)?;
                info!(
                    fleet = %fleet.name,
                    device = %adopted.fingerprint,
                    "device adopted into fleet"
                );
            }
        }
        Ok(())
    }

    /// Persist state when it changed, logging lifecycle transitions.
    fn persist(&self, previous: Option<&RolloutState>, state: &RolloutState) -> DriverResult<()> {
        if previous == Some(state) {
            return Ok(());
        }
        match (previous.map(|p| p.status), state.status) {
            (prev, RolloutStatus::Suspended) if prev != Some(RolloutStatus::Suspended) => {
                warn!(
                    fleet = %state.fleet,
                    batch = state.batch_index,
                    reason = ?state.reason,
                    message = state.message.as_deref().unwrap_or(""),
                    "rollout suspended"
                );
            }
            (Some(RolloutStatus::Suspended), RolloutStatus::Active) => {
                info!(fleet = %state.fleet, batch = state.batch_index, "rollout resumed");
            }
            (prev, RolloutStatus::Completed) if prev != Some(RolloutStatus::Completed) => {
                info!(
                    fleet = %state.fleet,
                    version = state.template_version,
                    message = state.message.as_deref().unwrap_or(""),
                    "rollout completed"
                );
            }
            _ => {
                if previous.map(|p| p.batch_index) != Some(state.batch_index) {
                    info!(
                        fleet = %state.fleet,
                        batch = state.batch_index,
                        version = state.template_version,
                        "batch started"
                    );
                }
            }
        }
        self.store.put_rollout_state(state)?;
        Ok(())
    }

    /// Event loop for one fleet. Exits when the event channel closes or
    /// shutdown is signalled.
    pub async fn run(
        self,
        fleet: String,
        mut events: mpsc::Receiver<FleetEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(%fleet, "rollout driver started");
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    // Coalesce: one pass covers everything queued so far.
                    while events.try_recv().is_ok() {}
                    debug!(%fleet, ?event, "reconciling");
                    if let Err(e) = self.reconcile(&fleet) {
                        error!(%fleet, error = %e, "reconcile failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(%fleet, "rollout driver stopped");
    }

    /// Spawn the driver loop for a fleet, returning its event handle.
    pub fn spawn(
        self,
        fleet: String,
        shutdown: watch::Receiver<bool>,
    ) -> (mpsc::Sender<FleetEvent>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let handle = tokio::spawn(self.run(fleet, rx, shutdown));
        (tx, handle)
    }
}

/// Current Unix time in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
