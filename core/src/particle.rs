//! Weighted particle populations and their summary statistics.
//!
//! A [`ParticleSet`] stores N states of dimension D as the columns of a `D × N` matrix together
//! with N normalized weights. Log-weights are normalized with the log-sum-exp shift
//! `w_i ∝ exp(ℓ_i - max ℓ)`, and a population whose weights cannot be normalized is reported as
//! [`FilterError::WeightDegeneracy`] instead of being patched with uniform weights.

use crate::errors::{FilterError, Result};

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};

/// Lower quantile level of the credible band recorded per step.
pub const LOWER_QUANTILE: f64 = 0.05;
/// Upper quantile level of the credible band recorded per step.
pub const UPPER_QUANTILE: f64 = 0.95;

/// How a point estimate is extracted from a particle population.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ParticleAveragingStrategy {
    WeightedAverage,
    UnweightedAverage,
    HighestWeight,
}
impl Default for ParticleAveragingStrategy {
    fn default() -> Self {
        ParticleAveragingStrategy::WeightedAverage
    }
}

/// Normalize log-weights in place of a probability vector.
///
/// `NaN` log-weights count as zero weight. Fails with `WeightDegeneracy { step }` when the
/// largest log-weight is not finite or the shifted weights do not sum to a positive finite number.
pub fn normalize_log_weights(log_weights: &DVector<f64>, step: usize) -> Result<DVector<f64>> {
    if log_weights.is_empty() {
        return Err(FilterError::EmptyParticleSet);
    }
    let max = log_weights
        .iter()
        .filter(|l| !l.is_nan())
        .fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    if !max.is_finite() {
        return Err(FilterError::WeightDegeneracy { step });
    }
    let shifted = log_weights.map(|l| if l.is_nan() { 0.0 } else { (l - max).exp() });
    let total = shifted.sum();
    if !(total > 0.0) || !total.is_finite() {
        return Err(FilterError::WeightDegeneracy { step });
    }
    Ok(shifted / total)
}

/// The particle population at one time step.
#[derive(Clone, PartialEq)]
pub struct ParticleSet {
    states: DMatrix<f64>,
    weights: DVector<f64>,
}

impl ParticleSet {
    /// Build from a `D × N` state matrix and N weights. Weights must be non-negative with a
    /// positive sum; they are renormalized.
    pub fn new(states: DMatrix<f64>, weights: DVector<f64>) -> Result<Self> {
        if states.ncols() == 0 {
            return Err(FilterError::EmptyParticleSet);
        }
        if weights.len() != states.ncols() {
            return Err(FilterError::dimension("particle weights", states.ncols(), weights.len()));
        }
        if let Some(w) = weights.iter().find(|w| !(**w >= 0.0) || !w.is_finite()) {
            return Err(FilterError::InvalidParameter {
                name: "particle weight",
                value: *w,
                reason: "must be finite and non-negative",
            });
        }
        let total = weights.sum();
        if !(total > 0.0) {
            return Err(FilterError::WeightDegeneracy { step: 0 });
        }
        Ok(ParticleSet {
            states,
            weights: weights / total,
        })
    }

    /// Uniformly weighted population from a `D × N` state matrix.
    pub fn uniform(states: DMatrix<f64>) -> Result<Self> {
        let n = states.ncols();
        if n == 0 {
            return Err(FilterError::EmptyParticleSet);
        }
        Ok(ParticleSet {
            states,
            weights: DVector::from_element(n, 1.0 / n as f64),
        })
    }

    /// Uniformly weighted population from an `N × D` cloud (one particle per row).
    pub fn from_rows(cloud: &DMatrix<f64>) -> Result<Self> {
        Self::uniform(cloud.transpose())
    }

    pub fn len(&self) -> usize {
        self.states.ncols()
    }
    pub fn is_empty(&self) -> bool {
        self.states.ncols() == 0
    }
    pub fn dimension(&self) -> usize {
        self.states.nrows()
    }
    /// `D × N` matrix of particle states.
    pub fn states(&self) -> &DMatrix<f64> {
        &self.states
    }
    pub fn weights(&self) -> &DVector<f64> {
        &self.weights
    }
    pub fn particle(&self, i: usize) -> DVector<f64> {
        self.states.column(i).clone_owned()
    }

    /// Replace the states, keeping the weights (predict step).
    pub(crate) fn set_states(&mut self, states: DMatrix<f64>) {
        debug_assert_eq!(states.shape(), self.states.shape());
        self.states = states;
    }

    /// Fold per-particle log-likelihoods into the current weights and renormalize:
    /// `ℓ_i = ln w_i + log_likelihood_i`.
    pub fn reweight(&mut self, log_likelihoods: &DVector<f64>, step: usize) -> Result<()> {
        if log_likelihoods.len() != self.len() {
            return Err(FilterError::dimension("log-likelihoods", self.len(), log_likelihoods.len()));
        }
        let log_weights = self.weights.zip_map(log_likelihoods, |w, l| w.ln() + l);
        self.weights = normalize_log_weights(&log_weights, step)?;
        Ok(())
    }

    /// Replace the weights by normalized `exp(log_weights)` without folding in the current ones.
    pub(crate) fn set_log_weights(&mut self, log_weights: &DVector<f64>, step: usize) -> Result<()> {
        self.weights = normalize_log_weights(log_weights, step)?;
        Ok(())
    }

    /// Effective sample size `1 / Σ w_i²`.
    pub fn effective_sample_size(&self) -> f64 {
        1.0 / self.weights.norm_squared()
    }

    /// New uniformly weighted population made of the particles at `indices`.
    pub fn select(&self, indices: &[usize]) -> ParticleSet {
        let states = self.states.select_columns(indices);
        let n = indices.len();
        ParticleSet {
            states,
            weights: DVector::from_element(n, 1.0 / n as f64),
        }
    }

    pub fn mean(&self) -> DVector<f64> {
        &self.states * &self.weights
    }

    /// Weighted covariance `Σ w_i (x_i - m)(x_i - m)ᵀ`.
    pub fn covariance(&self) -> DMatrix<f64> {
        let mean = self.mean();
        let mut centered = self.states.clone();
        for mut column in centered.column_iter_mut() {
            column -= &mean;
        }
        let mut scaled = centered.clone();
        for (mut column, w) in scaled.column_iter_mut().zip(self.weights.iter()) {
            column *= *w;
        }
        scaled * centered.transpose()
    }

    /// Per-dimension weighted quantile: the smallest particle value whose cumulative weight
    /// reaches `level`.
    pub fn quantile(&self, level: f64) -> DVector<f64> {
        let n = self.len();
        let mut order: Vec<usize> = (0..n).collect();
        DVector::from_iterator(
            self.dimension(),
            self.states.row_iter().map(|row| {
                order.sort_by(|&a, &b| row[a].total_cmp(&row[b]));
                let mut cumulative = 0.0;
                for &i in order.iter() {
                    cumulative += self.weights[i];
                    if cumulative >= level {
                        return row[i];
                    }
                }
                row[order[n - 1]]
            }),
        )
    }

    /// Point estimate under the given averaging strategy.
    pub fn estimate(&self, strategy: ParticleAveragingStrategy) -> DVector<f64> {
        match strategy {
            ParticleAveragingStrategy::WeightedAverage => self.mean(),
            ParticleAveragingStrategy::UnweightedAverage => {
                self.states.column_mean()
            }
            ParticleAveragingStrategy::HighestWeight => {
                let best = self.weights.argmax().0;
                self.particle(best)
            }
        }
    }
}

impl Debug for ParticleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let min_weight = self.weights.min();
        let max_weight = self.weights.max();
        f.debug_struct("ParticleSet")
            .field("num_particles", &self.len())
            .field("dimension", &self.dimension())
            .field("effective_particles", &self.effective_sample_size())
            .field(
                "weight_range",
                &format_args!("[{:.4e}, {:.4e}]", min_weight, max_weight),
            )
            .finish()
    }
}

/// Summary statistics recorded for one time step.
#[derive(Clone, Debug, PartialEq)]
pub struct StepSummary {
    pub mean: DVector<f64>,
    pub covariance: DMatrix<f64>,
    /// 5% weighted quantile per dimension.
    pub lower: DVector<f64>,
    /// 95% weighted quantile per dimension.
    pub upper: DVector<f64>,
    /// Effective sample size before any resampling at this step.
    pub effective_sample_size: f64,
    pub resampled: bool,
    pub observed: bool,
}

impl StepSummary {
    pub fn of(
        particles: &ParticleSet,
        effective_sample_size: f64,
        resampled: bool,
        observed: bool,
    ) -> Self {
        StepSummary {
            mean: particles.mean(),
            covariance: particles.covariance(),
            lower: particles.quantile(LOWER_QUANTILE),
            upper: particles.quantile(UPPER_QUANTILE),
            effective_sample_size,
            resampled,
            observed,
        }
    }
}
