//! Error types for the rollout driver.

use thiserror::Error;

/// Result type alias for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Errors that can occur while driving a rollout.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("state store error: {0}")]
    State(#[from] edgefleet_state::StateError),
}

impl DriverError {
    /// True when the underlying failure is an optimistic-concurrency
    /// conflict, which the driver retries within a reconcile.
    pub fn is_conflict(&self) -> bool {
        matches!(self, DriverError::State(e) if e.is_conflict())
    }
}
