//! Resampling schemes and the policy deciding when to apply them.
//!
//! A [`Resampler`] turns N normalized weights into N ancestor indices drawn with replacement, so
//! that index `i` appears `N w_i` times in expectation. All schemes take the generator explicitly
//! and are deterministic for a given generator state. Systematic, stratified, and residual
//! resampling have lower variance than multinomial resampling; systematic is the default.

use crate::errors::{FilterError, Result};

use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

/// Draws ancestor indices from normalized weights.
pub trait Resampler: Send + Sync {
    fn resample(&self, weights: &[f64], rng: &mut dyn RngCore) -> Vec<usize>;
}

/// Inclusive cumulative sum with the last entry pinned to exactly 1.
fn cumulative(weights: &[f64]) -> Vec<f64> {
    let mut cumsum: Vec<f64> = weights
        .iter()
        .scan(0.0, |acc, w| {
            *acc += w;
            Some(*acc)
        })
        .collect();
    if let Some(last) = cumsum.last_mut() {
        *last = 1.0;
    }
    cumsum
}

/// Map sorted positions in `[0, 1)` to indices with a two-pointer sweep over the cumulative sum.
fn sweep(cumsum: &[f64], positions: impl Iterator<Item = f64>) -> Vec<usize> {
    let n = cumsum.len();
    let mut indices = Vec::with_capacity(n);
    let mut j = 0usize;
    for pos in positions {
        while j < n - 1 && cumsum[j] <= pos {
            j += 1;
        }
        indices.push(j);
    }
    indices
}

/// One uniform offset shared by N evenly spaced positions `(i + u) / N`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystematicResampler;

impl Resampler for SystematicResampler {
    fn resample(&self, weights: &[f64], rng: &mut dyn RngCore) -> Vec<usize> {
        let n = weights.len();
        if n == 0 {
            return Vec::new();
        }
        let step = 1.0 / n as f64;
        let offset: f64 = rng.random::<f64>() * step;
        sweep(&cumulative(weights), (0..n).map(|i| offset + step * i as f64))
    }
}

/// An independent uniform offset per stratum: positions `(i + u_i) / N`.
#[derive(Clone, Copy, Debug, Default)]
pub struct StratifiedResampler;

impl Resampler for StratifiedResampler {
    fn resample(&self, weights: &[f64], rng: &mut dyn RngCore) -> Vec<usize> {
        let n = weights.len();
        if n == 0 {
            return Vec::new();
        }
        let step = 1.0 / n as f64;
        let positions: Vec<f64> = (0..n)
            .map(|i| (i as f64 + rng.random::<f64>()) * step)
            .collect();
        sweep(&cumulative(weights), positions.into_iter())
    }
}

/// N independent categorical draws.
#[derive(Clone, Copy, Debug, Default)]
pub struct MultinomialResampler;

impl Resampler for MultinomialResampler {
    fn resample(&self, weights: &[f64], rng: &mut dyn RngCore) -> Vec<usize> {
        let n = weights.len();
        let cumsum = cumulative(weights);
        (0..n)
            .map(|_| {
                let u: f64 = rng.random();
                cumsum.partition_point(|&c| c <= u).min(n - 1)
            })
            .collect()
    }
}

/// `floor(N w_i)` deterministic copies of each particle, the remainder filled by systematic
/// resampling of the residual weights.
#[derive(Clone, Copy, Debug, Default)]
pub struct ResidualResampler;

impl Resampler for ResidualResampler {
    fn resample(&self, weights: &[f64], rng: &mut dyn RngCore) -> Vec<usize> {
        let n = weights.len();
        let mut indices = Vec::with_capacity(n);
        let mut residual = vec![0.0; n];
        for (i, &w) in weights.iter().enumerate() {
            let scaled = w * n as f64;
            let copies = scaled.floor() as usize;
            indices.extend(std::iter::repeat_n(i, copies));
            residual[i] = scaled - copies as f64;
        }
        // Round-off can push the deterministic copies past N.
        indices.truncate(n);
        let remaining = n - indices.len();
        if remaining == 0 {
            return indices;
        }
        let total: f64 = residual.iter().sum();
        if !(total > 0.0) {
            // Only possible through round-off; top up from the heaviest particle.
            let best = weights
                .iter()
                .enumerate()
                .fold(0, |best, (i, w)| if *w > weights[best] { i } else { best });
            indices.extend(std::iter::repeat_n(best, remaining));
            return indices;
        }
        for r in residual.iter_mut() {
            *r /= total;
        }
        let step = 1.0 / remaining as f64;
        let offset: f64 = rng.random::<f64>() * step;
        indices.extend(sweep(
            &cumulative(&residual),
            (0..remaining).map(|k| offset + step * k as f64),
        ));
        indices
    }
}

/// Resampling scheme selected in a configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ParticleResamplingStrategy {
    Systematic,
    Stratified,
    Multinomial,
    Residual,
}
impl Default for ParticleResamplingStrategy {
    fn default() -> Self {
        ParticleResamplingStrategy::Systematic
    }
}

impl ParticleResamplingStrategy {
    pub fn resampler(&self) -> Box<dyn Resampler> {
        match self {
            ParticleResamplingStrategy::Systematic => Box::new(SystematicResampler),
            ParticleResamplingStrategy::Stratified => Box::new(StratifiedResampler),
            ParticleResamplingStrategy::Multinomial => Box::new(MultinomialResampler),
            ParticleResamplingStrategy::Residual => Box::new(ResidualResampler),
        }
    }
}

/// When the filter resamples after reweighting.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "when", rename_all = "snake_case")]
pub enum ResamplingPolicy {
    /// Every step with an observation.
    Always,
    /// When the effective sample size drops below `threshold · N`.
    EffectiveSampleSize { threshold: f64 },
    Never,
}

impl Default for ResamplingPolicy {
    fn default() -> Self {
        ResamplingPolicy::Always
    }
}

impl ResamplingPolicy {
    pub fn validate(&self) -> Result<()> {
        match self {
            ResamplingPolicy::EffectiveSampleSize { threshold } if !(*threshold > 0.0 && *threshold <= 1.0) => {
                Err(FilterError::InvalidParameter {
                    name: "ess_threshold",
                    value: *threshold,
                    reason: "must lie in (0, 1]",
                })
            }
            _ => Ok(()),
        }
    }
    pub fn should_resample(&self, effective_sample_size: f64, num_particles: usize) -> bool {
        match self {
            ResamplingPolicy::Always => true,
            ResamplingPolicy::EffectiveSampleSize { threshold } => {
                effective_sample_size < threshold * num_particles as f64
            }
            ResamplingPolicy::Never => false,
        }
    }
}
