//! Noise generators shared by the filters and the simulators.
//!
//! [`GaussianNoise`] draws zero-mean correlated Gaussian vectors from a (possibly singular)
//! covariance and is what the particle filter uses in its predict step. [`ObservationNoise`]
//! describes how a simulator corrupts clean observations, including the heavy-tailed
//! contamination models used in the robustness experiments.

use crate::errors::{FilterError, Result};
use crate::linalg::psd_square_root;

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal, StudentT};
use serde::{Deserialize, Serialize};

/// Zero-mean Gaussian noise `L z`, `z ~ N(0, I)`, with `L Lᵀ = covariance`.
#[derive(Clone, Debug)]
pub struct GaussianNoise {
    factor: DMatrix<f64>,
    is_zero: bool,
}

impl GaussianNoise {
    /// Build from a symmetric positive semi-definite covariance. A zero covariance is allowed
    /// and yields exactly zero noise without consuming random numbers.
    pub fn new(covariance: &DMatrix<f64>, what: &'static str) -> Result<Self> {
        let factor = psd_square_root(covariance, what)?;
        let is_zero = factor.iter().all(|v| *v == 0.0);
        Ok(GaussianNoise { factor, is_zero })
    }
    /// Independent components with the given standard deviations.
    pub fn from_std(std: &[f64], what: &'static str) -> Result<Self> {
        let variances = DVector::from_iterator(std.len(), std.iter().map(|s| s * s));
        Self::new(&DMatrix::from_diagonal(&variances), what)
    }
    pub fn dimension(&self) -> usize {
        self.factor.nrows()
    }
    pub fn is_zero(&self) -> bool {
        self.is_zero
    }
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> DVector<f64> {
        let n = self.factor.nrows();
        if self.is_zero {
            return DVector::zeros(n);
        }
        let z: DVector<f64> = DVector::from_iterator(n, (0..n).map(|_| StandardNormal.sample(rng)));
        &self.factor * z
    }
}

/// Observation corruption model used by the simulators.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObservationNoise {
    /// Nominal Gaussian noise only.
    Gaussian,
    /// With probability `probability` the whole observation receives an extra
    /// `scale · N(0, I)` kick on top of the nominal noise.
    Impulsive { probability: f64, scale: f64 },
    /// With probability `probability` each observation's noise is a Student-t draw with
    /// `degrees_of_freedom` instead of a standard normal one, then scaled by the nominal
    /// standard deviation. Small degrees of freedom (0.5) give extremely heavy tails.
    Explosive {
        probability: f64,
        degrees_of_freedom: f64,
    },
}

impl Default for ObservationNoise {
    fn default() -> Self {
        ObservationNoise::Gaussian
    }
}

impl ObservationNoise {
    pub fn contamination_probability(&self) -> f64 {
        match self {
            ObservationNoise::Gaussian => 0.0,
            ObservationNoise::Impulsive { probability, .. } => *probability,
            ObservationNoise::Explosive { probability, .. } => *probability,
        }
    }
    /// Same model with a different contamination probability (used by contamination sweeps).
    pub fn with_probability(&self, probability: f64) -> Self {
        match self {
            ObservationNoise::Gaussian => ObservationNoise::Gaussian,
            ObservationNoise::Impulsive { scale, .. } => ObservationNoise::Impulsive {
                probability,
                scale: *scale,
            },
            ObservationNoise::Explosive {
                degrees_of_freedom, ..
            } => ObservationNoise::Explosive {
                probability,
                degrees_of_freedom: *degrees_of_freedom,
            },
        }
    }
    pub fn validate(&self) -> Result<()> {
        let p = self.contamination_probability();
        if !(0.0..=1.0).contains(&p) {
            return Err(FilterError::InvalidParameter {
                name: "contamination_probability",
                value: p,
                reason: "must lie in [0, 1]",
            });
        }
        match self {
            ObservationNoise::Impulsive { scale, .. } if !(*scale >= 0.0) => {
                Err(FilterError::InvalidParameter {
                    name: "explosion_scale",
                    value: *scale,
                    reason: "must be non-negative",
                })
            }
            ObservationNoise::Explosive {
                degrees_of_freedom, ..
            } if !(*degrees_of_freedom > 0.0) || !degrees_of_freedom.is_finite() => {
                Err(FilterError::InvalidParameter {
                    name: "degrees_of_freedom",
                    value: *degrees_of_freedom,
                    reason: "must be positive and finite",
                })
            }
            _ => Ok(()),
        }
    }
    /// Draw one observation noise vector. `nominal` carries the nominal Gaussian covariance.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        nominal: &GaussianNoise,
        rng: &mut R,
    ) -> Result<DVector<f64>> {
        Ok(match self {
            ObservationNoise::Gaussian => nominal.sample(rng),
            ObservationNoise::Impulsive { probability, scale } => {
                let mut noise = nominal.sample(rng);
                if rng.random::<f64>() < *probability {
                    for v in noise.iter_mut() {
                        let z: f64 = StandardNormal.sample(rng);
                        *v += scale * z;
                    }
                }
                noise
            }
            ObservationNoise::Explosive {
                probability,
                degrees_of_freedom,
            } => {
                let u: f64 = rng.random();
                let n = nominal.dimension();
                let standard = if u <= *probability {
                    self.validate()?;
                    let t = StudentT::new(*degrees_of_freedom).map_err(|_| {
                        FilterError::InvalidParameter {
                            name: "degrees_of_freedom",
                            value: *degrees_of_freedom,
                            reason: "must be positive and finite",
                        }
                    })?;
                    DVector::from_iterator(n, (0..n).map(|_| t.sample(rng)))
                } else {
                    DVector::from_iterator(n, (0..n).map(|_| StandardNormal.sample(rng)))
                };
                &nominal.factor * standard
            }
        })
    }
}
