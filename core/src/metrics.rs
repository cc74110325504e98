//! Scoring of estimated trajectories against the simulated truth.
//!
//! Three scores are reported per run:
//! - mean squared error of the point estimate, per state dimension,
//! - coverage: the fraction of time steps where the true state lies inside the 5%-95% band,
//! - predictive score: a weighted median absolute error between the observations and the mean
//!   predicted observation. Dimension `j` is weighted by `1 / w_j` where `w_j` is the magnitude
//!   of the median observation in that dimension normalized to sum to one, so dimensions with
//!   large observation values do not dominate.

use crate::errors::{FilterError, Result};
use crate::filter::Trajectory;
use crate::kalman::GaussianTrack;
use crate::measurements::ObservationModel;
use crate::particle::{LOWER_QUANTILE, UPPER_QUANTILE};

use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

/// Scores of one estimator on one run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterScores {
    pub mse: Vec<f64>,
    pub coverage: Vec<f64>,
    pub predictive: f64,
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    if n == 0 {
        f64::NAN
    } else if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2 - 1] + values[n / 2])
    }
}

/// Per-dimension mean squared error between two equally long sequences of vectors.
pub fn mean_squared_error(truth: &[DVector<f64>], estimate: &[DVector<f64>]) -> Result<DVector<f64>> {
    if truth.len() != estimate.len() {
        return Err(FilterError::dimension("estimated trajectory length", truth.len(), estimate.len()));
    }
    let Some(first) = truth.first() else {
        return Err(FilterError::EmptyParticleSet);
    };
    let mut total = DVector::<f64>::zeros(first.len());
    for (x, m) in truth.iter().zip(estimate.iter()) {
        let diff = x - m;
        total += diff.component_mul(&diff);
    }
    Ok(total / truth.len() as f64)
}

/// Per-dimension fraction of steps with `lower ≤ truth ≤ upper`.
pub fn coverage(
    truth: &[DVector<f64>],
    lower: &[DVector<f64>],
    upper: &[DVector<f64>],
) -> Result<DVector<f64>> {
    if lower.len() != truth.len() || upper.len() != truth.len() {
        return Err(FilterError::dimension("credible band length", truth.len(), lower.len().min(upper.len())));
    }
    let Some(first) = truth.first() else {
        return Err(FilterError::EmptyParticleSet);
    };
    let mut inside = DVector::<f64>::zeros(first.len());
    for ((x, lo), hi) in truth.iter().zip(lower.iter()).zip(upper.iter()) {
        for j in 0..x.len() {
            if lo[j] <= x[j] && x[j] <= hi[j] {
                inside[j] += 1.0;
            }
        }
    }
    Ok(inside / truth.len() as f64)
}

/// Weighted median absolute error between observations `y_1..y_T` and predicted observation
/// means for the same steps. Missing or non-finite observations are skipped.
pub fn predictive_score(
    observations: &[Option<DVector<f64>>],
    predicted: &[DVector<f64>],
) -> Result<f64> {
    if observations.len() != predicted.len() {
        return Err(FilterError::dimension("predicted observations", observations.len(), predicted.len()));
    }
    let pairs: Vec<(&DVector<f64>, &DVector<f64>)> = observations
        .iter()
        .zip(predicted.iter())
        .filter_map(|(y, p)| y.as_ref().filter(|y| y.iter().all(|v| v.is_finite())).map(|y| (y, p)))
        .collect();
    let Some((first, _)) = pairs.first() else {
        return Err(FilterError::InvalidParameter {
            name: "observations",
            value: 0.0,
            reason: "no usable observation to score against",
        });
    };
    let dim = first.len();
    let mut errors = Vec::with_capacity(dim);
    let mut magnitudes = Vec::with_capacity(dim);
    for j in 0..dim {
        let mut abs_err: Vec<f64> = pairs.iter().map(|(y, p)| (y[j] - p[j]).abs()).collect();
        let mut values: Vec<f64> = pairs.iter().map(|(y, _)| y[j]).collect();
        errors.push(median(&mut abs_err));
        magnitudes.push(median(&mut values).abs());
    }
    let total: f64 = magnitudes.iter().sum();
    let weights: Vec<f64> = if magnitudes.iter().all(|m| *m > 0.0) && total.is_finite() {
        magnitudes.iter().map(|m| total / m).collect()
    } else {
        vec![1.0; dim]
    };
    let weight_sum: f64 = weights.iter().sum();
    Ok(errors.iter().zip(weights.iter()).map(|(e, w)| e * w).sum::<f64>() / weight_sum)
}

/// Score a particle filter trajectory (`T + 1` records) against the latent states `x_0..x_T`.
pub fn score_trajectory(
    truth: &[DVector<f64>],
    trajectory: &Trajectory,
    observations: &[Option<DVector<f64>>],
) -> Result<FilterScores> {
    let lower: Vec<DVector<f64>> = trajectory.summaries().iter().map(|s| s.lower.clone()).collect();
    let upper: Vec<DVector<f64>> = trajectory.summaries().iter().map(|s| s.upper.clone()).collect();
    let predicted = trajectory.mean_predicted_observations();
    Ok(FilterScores {
        mse: mean_squared_error(truth, trajectory.estimates())?.as_slice().to_vec(),
        coverage: coverage(truth, &lower, &upper)?.as_slice().to_vec(),
        predictive: predictive_score(observations, predicted.get(1..).unwrap_or(&[]))?,
    })
}

/// Score a Gaussian estimate track; the band is `mean ± z σ` with `z` the 95% standard normal
/// quantile, and the predicted observation is `h(mean)`.
pub fn score_gaussian_track(
    truth: &[DVector<f64>],
    track: &GaussianTrack,
    observation: &dyn ObservationModel,
    observations: &[Option<DVector<f64>>],
) -> Result<FilterScores> {
    let z = Normal::standard().inverse_cdf(UPPER_QUANTILE);
    debug_assert!((Normal::standard().inverse_cdf(LOWER_QUANTILE) + z).abs() < 1e-9);
    let spreads: Vec<DVector<f64>> = track
        .covariances
        .iter()
        .map(|p| p.diagonal().map(|v| z * v.max(0.0).sqrt()))
        .collect();
    let lower: Vec<DVector<f64>> = track.means.iter().zip(spreads.iter()).map(|(m, s)| m - s).collect();
    let upper: Vec<DVector<f64>> = track.means.iter().zip(spreads.iter()).map(|(m, s)| m + s).collect();
    let predicted: Vec<DVector<f64>> = track.means.iter().skip(1).map(|m| observation.expected(m)).collect();
    Ok(FilterScores {
        mse: mean_squared_error(truth, &track.means)?.as_slice().to_vec(),
        coverage: coverage(truth, &lower, &upper)?.as_slice().to_vec(),
        predictive: predictive_score(observations, &predicted)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn v(values: &[f64]) -> DVector<f64> {
        DVector::from_column_slice(values)
    }

    #[test]
    fn mse_per_dimension() {
        let truth = vec![v(&[0.0, 0.0]), v(&[1.0, 1.0])];
        let est = vec![v(&[1.0, 0.0]), v(&[1.0, 3.0])];
        let mse = mean_squared_error(&truth, &est).unwrap();
        assert_approx_eq!(mse[0], 0.5, 1e-15);
        assert_approx_eq!(mse[1], 2.0, 1e-15);
        assert!(mean_squared_error(&truth, &est[..1]).is_err());
    }

    #[test]
    fn coverage_counts_inclusive_band() {
        let truth = vec![v(&[0.0]), v(&[1.0]), v(&[5.0]), v(&[2.0])];
        let lower = vec![v(&[-1.0]); 4];
        let upper = vec![v(&[2.0]); 4];
        assert_approx_eq!(coverage(&truth, &lower, &upper).unwrap()[0], 0.75, 1e-15);
    }

    #[test]
    fn predictive_score_is_median_error_in_one_dimension() {
        let obs = vec![Some(v(&[1.0])), None, Some(v(&[3.0])), Some(v(&[10.0]))];
        let pred = vec![v(&[0.0]), v(&[100.0]), v(&[3.5]), v(&[0.0])];
        // errors 1, 0.5, 10 -> median 1
        assert_approx_eq!(predictive_score(&obs, &pred).unwrap(), 1.0, 1e-15);
    }

    #[test]
    fn predictive_score_downweights_large_dimensions() {
        // medians 1 and 100 -> w = (1/101, 100/101) -> inverse weights (101, 1.01)
        let obs = vec![Some(v(&[1.0, 100.0])); 3];
        let pred = vec![v(&[0.0, 90.0]); 3];
        let expected = (1.0 * 101.0 + 10.0 * 1.01) / (101.0 + 1.01);
        assert_approx_eq!(predictive_score(&obs, &pred).unwrap(), expected, 1e-12);
    }

    #[test]
    fn predictive_score_needs_an_observation() {
        assert!(predictive_score(&[None, None], &[v(&[0.0]), v(&[0.0])]).is_err());
    }
}
