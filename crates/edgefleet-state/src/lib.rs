//! edgefleet-state — embedded state store for the EdgeFleet control plane.
//!
//! Backed by [redb](https://docs.rs/redb), implements the device registry
//! and fleet policy store the rollout core depends on.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Devices and fleets carry a resource version; mutating writes go through
//! check-and-set so concurrent writers detect stale reads instead of
//! clobbering each other.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use store::StateStore;
