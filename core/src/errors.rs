//! Error types for the estimation engine.
//!
//! Invalid configurations are rejected when a filter, model, or simulator is built. Failures
//! that can only be detected while sampling (weight degeneracy) are surfaced from
//! [`crate::filter::ParticleFilter::sample`] and leave the filter in a failed state.

use std::io;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FilterError>;

/// Errors raised by filters, models, simulators, and the experiment runner.
#[derive(Error, Debug)]
pub enum FilterError {
    /// Two inputs that must agree in size do not.
    #[error("dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// A covariance that must be invertible is not symmetric positive definite.
    #[error("{0} must be symmetric positive definite")]
    NotPositiveDefinite(&'static str),

    /// A covariance that only needs to be factorable is not positive semi-definite.
    #[error("{0} must be symmetric positive semi-definite")]
    NotPositiveSemiDefinite(&'static str),

    /// A scalar parameter is outside its admissible range.
    #[error("invalid parameter {name} = {value}: {reason}")]
    InvalidParameter {
        name: &'static str,
        value: f64,
        reason: &'static str,
    },

    /// A particle set with no particles.
    #[error("particle set must contain at least one particle")]
    EmptyParticleSet,

    /// Every importance weight vanished at a time step, even after log-sum-exp stabilization.
    #[error("importance weights collapsed to zero at time step {step}")]
    WeightDegeneracy { step: usize },

    /// `sample()` was called on a filter that has already run (or failed) without a reset.
    #[error("filter has already been sampled; call reset() before sampling again")]
    AlreadySampled,

    /// Trajectory accessors were used before a successful `sample()`.
    #[error("filter has not been sampled yet")]
    NotSampled,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Configuration file could not be parsed or had an unsupported format.
    #[error("configuration error: {0}")]
    Config(String),
}

impl FilterError {
    pub(crate) fn dimension(what: &'static str, expected: usize, actual: usize) -> Self {
        FilterError::DimensionMismatch {
            what,
            expected,
            actual,
        }
    }
}
