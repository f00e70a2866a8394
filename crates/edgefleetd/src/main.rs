//! edgefleetd — the EdgeFleet control-plane daemon.
//!
//! Single binary that assembles the control plane:
//! - State store (redb)
//! - One rollout driver loop per fleet
//! - Periodic fleet discovery + tick fan-out
//!
//! # Usage
//!
//! ```text
//! edgefleetd run --data-dir /var/lib/edgefleet --tick-interval 15
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use edgefleet_rollout::{FleetEvent, RolloutDriver};
use edgefleet_state::StateStore;

#[derive(Parser)]
#[command(name = "edgefleetd", about = "EdgeFleet control-plane daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane.
    Run {
        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/edgefleet")]
        data_dir: PathBuf,

        /// Seconds between rollout evaluation ticks.
        #[arg(long, default_value = "15")]
        tick_interval: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,edgefleetd=debug,edgefleet=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            data_dir,
            tick_interval,
        } => run(data_dir, tick_interval).await,
    }
}

/// Event handle for one fleet's driver loop.
struct FleetHandle {
    events: mpsc::Sender<FleetEvent>,
    task: JoinHandle<()>,
}

async fn run(data_dir: PathBuf, tick_interval: u64) -> anyhow::Result<()> {
    info!("EdgeFleet daemon starting");

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("edgefleet.redb");

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let driver = RolloutDriver::new(store.clone());

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ctrl_c_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = ctrl_c_tx.send(true);
        }
    });

    // ── Fleet discovery + tick fan-out ─────────────────────────

    let mut handles: HashMap<String, FleetHandle> = HashMap::new();
    let mut ticker = tokio::time::interval(Duration::from_secs(tick_interval));
    let mut shutdown = shutdown_rx.clone();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let fleets = store.list_fleets()?;

                // Spawn a driver for each fleet we haven't seen yet.
                for fleet in &fleets {
                    if !handles.contains_key(&fleet.name) {
                        let (events, task) = driver
                            .clone()
                            .spawn(fleet.name.clone(), shutdown_rx.clone());
                        info!(fleet = %fleet.name, "driver spawned");
                        handles.insert(fleet.name.clone(), FleetHandle { events, task });
                    }
                }

                // Closing the channel lets a deleted fleet's driver run a
                // final cleanup pass before its loop exits.
                let live: std::collections::HashSet<&str> =
                    fleets.iter().map(|f| f.name.as_str()).collect();
                for (name, handle) in &handles {
                    if live.contains(name.as_str()) {
                        // A full buffer means a reconcile is already queued.
                        if handle.events.try_send(FleetEvent::Tick).is_err() {
                            debug!(fleet = %name, "tick skipped, driver busy");
                        }
                    } else {
                        let _ = handle.events.try_send(FleetEvent::FleetChanged);
                    }
                }
                handles.retain(|name, _| live.contains(name.as_str()));
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    // Wait for driver loops to wind down.
    for (name, handle) in handles {
        drop(handle.events);
        let _ = handle.task.await;
        debug!(fleet = %name, "driver stopped");
    }

    info!("EdgeFleet daemon stopped");
    Ok(())
}
