//! Observation likelihoods used to weight particles.
//!
//! Every likelihood works on the residual `r = y - h(x)` between an observation and a particle's
//! predicted observation and returns a log-weight contribution. Three families are provided:
//!
//! - [`GaussianLikelihood`]: `ln 𝒩(r; 0, R)`, the vanilla bootstrap/auxiliary weight.
//! - [`StudentTLikelihood`]: a multivariate Student-t density with scale `R` and `ν` degrees of
//!   freedom; heavy tails keep a single outlier from wiping out the population.
//! - [`BetaDivergenceLikelihood`]: the β-divergence pseudo-likelihood of a Gaussian model,
//!   `(p^β - 1) / β` with `p = 𝒩(r; 0, R)`. It is bounded below by `-1/β`, so as a residual
//!   grows the weight saturates instead of vanishing. At `β = 0` it is exactly `ln p`.
//!
//! The full β-divergence loss also carries the term `-(1+β)⁻¹ ∫ 𝒩(z; ·, R)^{1+β} dz`, which
//! does not depend on the particle and cancels in normalization. It is available from
//! [`BetaDivergenceLikelihood::integral_term`] but never added to the weights.

use crate::errors::{FilterError, Result};
use crate::linalg::{log_determinant, mahalanobis_squared, spd_cholesky};

use nalgebra::linalg::Cholesky;
use nalgebra::{DMatrix, DVector, Dyn};
use serde::{Deserialize, Serialize};
use statrs::function::gamma::ln_gamma;
use std::f64::consts::PI;

/// Default degrees of freedom of the Student-t likelihood (close to Cauchy).
pub const DEFAULT_DEGREES_OF_FREEDOM: f64 = 1.01;

/// Per-particle observation log-likelihood.
pub trait Likelihood: Send + Sync {
    /// Observation dimension the likelihood was built for.
    fn dimension(&self) -> usize;

    /// Log-weight contribution of a single residual `y - h(x)`.
    fn log_likelihood(&self, residual: &DVector<f64>) -> f64;

    /// Log-weight contributions for every column of an `obs_dim × N` matrix of predicted
    /// observations against one observation.
    fn log_likelihoods(&self, observation: &DVector<f64>, predicted: &DMatrix<f64>) -> DVector<f64> {
        DVector::from_iterator(
            predicted.ncols(),
            predicted
                .column_iter()
                .map(|h| self.log_likelihood(&(observation - h))),
        )
    }
}

/// Multivariate normal log-density with covariance `R`.
#[derive(Clone, Debug)]
pub struct GaussianLikelihood {
    chol: Cholesky<f64, Dyn>,
    log_normalizer: f64,
    log_det: f64,
}

impl GaussianLikelihood {
    pub fn new(covariance: &DMatrix<f64>) -> Result<Self> {
        let chol = spd_cholesky(covariance, "observation covariance")?;
        let d = covariance.nrows() as f64;
        let log_det = log_determinant(&chol);
        Ok(GaussianLikelihood {
            chol,
            log_normalizer: -0.5 * (d * (2.0 * PI).ln() + log_det),
            log_det,
        })
    }
    /// `ln |R|`
    pub fn log_determinant(&self) -> f64 {
        self.log_det
    }
}

impl Likelihood for GaussianLikelihood {
    fn dimension(&self) -> usize {
        self.chol.l_dirty().nrows()
    }
    fn log_likelihood(&self, residual: &DVector<f64>) -> f64 {
        self.log_normalizer - 0.5 * mahalanobis_squared(&self.chol, residual)
    }
}

/// Multivariate Student-t log-density with scale matrix `R` and `ν` degrees of freedom.
///
/// ```text
/// ln p(r) = lnΓ((ν+d)/2) - lnΓ(ν/2) - d/2 ln(νπ) - ½ ln|R| - (ν+d)/2 ln(1 + rᵀR⁻¹r / ν)
/// ```
#[derive(Clone, Debug)]
pub struct StudentTLikelihood {
    chol: Cholesky<f64, Dyn>,
    degrees_of_freedom: f64,
    log_normalizer: f64,
}

impl StudentTLikelihood {
    pub fn new(scale: &DMatrix<f64>, degrees_of_freedom: f64) -> Result<Self> {
        if !(degrees_of_freedom > 0.0) || !degrees_of_freedom.is_finite() {
            return Err(FilterError::InvalidParameter {
                name: "degrees_of_freedom",
                value: degrees_of_freedom,
                reason: "must be positive and finite",
            });
        }
        let chol = spd_cholesky(scale, "observation covariance")?;
        let d = scale.nrows() as f64;
        let nu = degrees_of_freedom;
        let log_normalizer = ln_gamma(0.5 * (nu + d))
            - ln_gamma(0.5 * nu)
            - 0.5 * d * (nu * PI).ln()
            - 0.5 * log_determinant(&chol);
        Ok(StudentTLikelihood {
            chol,
            degrees_of_freedom,
            log_normalizer,
        })
    }
    pub fn degrees_of_freedom(&self) -> f64 {
        self.degrees_of_freedom
    }
}

impl Likelihood for StudentTLikelihood {
    fn dimension(&self) -> usize {
        self.chol.l_dirty().nrows()
    }
    fn log_likelihood(&self, residual: &DVector<f64>) -> f64 {
        let nu = self.degrees_of_freedom;
        let d = residual.len() as f64;
        let m = mahalanobis_squared(&self.chol, residual);
        self.log_normalizer - 0.5 * (nu + d) * (m / nu).ln_1p()
    }
}

/// β-divergence robustified Gaussian pseudo-likelihood `(p^β - 1) / β`.
#[derive(Clone, Debug)]
pub struct BetaDivergenceLikelihood {
    gaussian: GaussianLikelihood,
    beta: f64,
}

impl BetaDivergenceLikelihood {
    /// `beta` must lie in `[0, 1]`; `0` reproduces the Gaussian log-likelihood exactly.
    pub fn new(covariance: &DMatrix<f64>, beta: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&beta) {
            return Err(FilterError::InvalidParameter {
                name: "beta",
                value: beta,
                reason: "must lie in [0, 1]",
            });
        }
        Ok(BetaDivergenceLikelihood {
            gaussian: GaussianLikelihood::new(covariance)?,
            beta,
        })
    }
    pub fn beta(&self) -> f64 {
        self.beta
    }
    /// Particle-independent part of the β-divergence loss,
    /// `-(2π)^{-βd/2} |R|^{-β/2} (1+β)^{-d/2-1}`.
    pub fn integral_term(&self) -> f64 {
        let b = self.beta;
        let d = self.gaussian.dimension() as f64;
        let log_term = -0.5 * b * d * (2.0 * PI).ln() - 0.5 * b * self.gaussian.log_determinant()
            - (0.5 * d + 1.0) * (1.0 + b).ln();
        -log_term.exp()
    }
}

impl Likelihood for BetaDivergenceLikelihood {
    fn dimension(&self) -> usize {
        self.gaussian.dimension()
    }
    fn log_likelihood(&self, residual: &DVector<f64>) -> f64 {
        let log_p = self.gaussian.log_likelihood(residual);
        if self.beta == 0.0 {
            log_p
        } else {
            (self.beta * log_p).exp_m1() / self.beta
        }
    }
}

/// Likelihood family selected in a filter configuration.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LikelihoodKind {
    Gaussian,
    StudentT { degrees_of_freedom: f64 },
    BetaDivergence { beta: f64 },
}

impl Default for LikelihoodKind {
    fn default() -> Self {
        LikelihoodKind::Gaussian
    }
}

impl LikelihoodKind {
    pub fn student_t() -> Self {
        LikelihoodKind::StudentT {
            degrees_of_freedom: DEFAULT_DEGREES_OF_FREEDOM,
        }
    }
    /// Instantiate the likelihood for an observation covariance `R`.
    pub fn build(&self, observation_covariance: &DMatrix<f64>) -> Result<Box<dyn Likelihood>> {
        Ok(match *self {
            LikelihoodKind::Gaussian => Box::new(GaussianLikelihood::new(observation_covariance)?),
            LikelihoodKind::StudentT { degrees_of_freedom } => Box::new(StudentTLikelihood::new(
                observation_covariance,
                degrees_of_freedom,
            )?),
            LikelihoodKind::BetaDivergence { beta } => {
                Box::new(BetaDivergenceLikelihood::new(observation_covariance, beta)?)
            }
        })
    }
    /// Robustness coefficient, if any.
    pub fn beta(&self) -> Option<f64> {
        match self {
            LikelihoodKind::BetaDivergence { beta } => Some(*beta),
            _ => None,
        }
    }
}
