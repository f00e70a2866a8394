//! Policy validation errors.

use thiserror::Error;

/// A structurally invalid rollout policy.
///
/// These are configuration errors: fatal to the current rollout, surfaced
/// to operators, and never retried until a corrected policy is written.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("batch sequence is empty")]
    EmptyBatchSequence,

    #[error("batch {batch} has a zero limit")]
    ZeroBatchLimit { batch: usize },

    #[error("batch {batch} has an invalid percentage limit: {percent}%")]
    InvalidPercentLimit { batch: usize, percent: u8 },

    #[error("batch {batch} has an invalid success threshold: {percent}%")]
    InvalidBatchThreshold { batch: usize, percent: u8 },

    #[error("invalid overall success threshold: {percent}%")]
    InvalidSuccessThreshold { percent: u8 },

    #[error("disruption budget allows zero unavailable devices, rollout can never progress")]
    ZeroMaxUnavailable,
}
