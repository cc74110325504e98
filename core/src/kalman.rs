//! Kalman-style baseline estimators (KF/UKF)
//!
//! These are the Gaussian baselines the particle filters are compared against: the exact linear
//! Kalman filter for linear-Gaussian systems and an unscented Kalman filter for nonlinear
//! dynamics or observations. Both implement [`BayesFilter`] and skip the update for missing
//! observations.

use crate::dynamics::TransitionModel;
use crate::errors::{FilterError, Result};
use crate::linalg::{matrix_square_root, psd_square_root, robust_spd_solve, spd_cholesky, symmetrize};
use crate::measurements::{ObservationModel, check_observation_model};
use crate::sim::StateSpaceModel;
use crate::BayesFilter;

use std::fmt::{self, Debug, Display};

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

fn check_prior(mean: &DVector<f64>, covariance: &DMatrix<f64>, dim: usize) -> Result<()> {
    if mean.len() != dim {
        return Err(FilterError::dimension("prior mean", dim, mean.len()));
    }
    if covariance.shape() != (dim, dim) {
        return Err(FilterError::dimension("prior covariance", dim, covariance.nrows()));
    }
    psd_square_root(covariance, "prior covariance")?;
    Ok(())
}

fn check_noise(
    transition_covariance: &DMatrix<f64>,
    dim: usize,
    observation_covariance: &DMatrix<f64>,
    obs_dim: usize,
) -> Result<()> {
    if transition_covariance.shape() != (dim, dim) {
        return Err(FilterError::dimension(
            "transition covariance",
            dim,
            transition_covariance.nrows(),
        ));
    }
    psd_square_root(transition_covariance, "transition covariance")?;
    if observation_covariance.shape() != (obs_dim, obs_dim) {
        return Err(FilterError::dimension(
            "observation covariance",
            obs_dim,
            observation_covariance.nrows(),
        ));
    }
    spd_cholesky(observation_covariance, "observation covariance")?;
    Ok(())
}

/// Linear Kalman filter for `x' = F x + w`, `y = H x + v`.
#[derive(Clone)]
pub struct KalmanFilter {
    mean_state: DVector<f64>,
    covariance: DMatrix<f64>,
    transition_matrix: DMatrix<f64>,
    transition_covariance: DMatrix<f64>,
    observation_matrix: DMatrix<f64>,
    observation_covariance: DMatrix<f64>,
}

impl Debug for KalmanFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KF")
            .field("mean_state", &self.mean_state)
            .field("covariance", &self.covariance)
            .finish()
    }
}

impl KalmanFilter {
    /// Fails if either model is nonlinear (has no matrix form) or if any dimension or
    /// covariance is invalid.
    pub fn new(
        mean: DVector<f64>,
        covariance: DMatrix<f64>,
        transition: &dyn TransitionModel,
        transition_covariance: &DMatrix<f64>,
        observation: &dyn ObservationModel,
        observation_covariance: &DMatrix<f64>,
    ) -> Result<Self> {
        let transition_matrix = transition.matrix().cloned().ok_or(FilterError::Config(
            "the Kalman filter needs a linear transition model".to_string(),
        ))?;
        let observation_matrix = observation.matrix().cloned().ok_or(FilterError::Config(
            "the Kalman filter needs a linear observation model".to_string(),
        ))?;
        let dim = transition_matrix.nrows();
        if observation_matrix.ncols() != dim {
            return Err(FilterError::dimension(
                "observation matrix columns",
                dim,
                observation_matrix.ncols(),
            ));
        }
        check_prior(&mean, &covariance, dim)?;
        check_noise(
            transition_covariance,
            dim,
            observation_covariance,
            observation_matrix.nrows(),
        )?;
        Ok(KalmanFilter {
            mean_state: mean,
            covariance,
            transition_matrix,
            transition_covariance: transition_covariance.clone(),
            observation_matrix,
            observation_covariance: observation_covariance.clone(),
        })
    }

    pub fn from_model<M: StateSpaceModel + ?Sized>(
        model: &M,
        mean: DVector<f64>,
        covariance: DMatrix<f64>,
    ) -> Result<Self> {
        Self::new(
            mean,
            covariance,
            model.transition(),
            model.transition_covariance(),
            model.observation(),
            model.observation_covariance(),
        )
    }
}

impl BayesFilter for KalmanFilter {
    fn predict(&mut self) {
        let f = &self.transition_matrix;
        self.mean_state = f * &self.mean_state;
        self.covariance = symmetrize(&(f * &self.covariance * f.transpose() + &self.transition_covariance));
    }
    fn update(&mut self, observation: &DVector<f64>) -> Result<()> {
        let h = &self.observation_matrix;
        let s = h * &self.covariance * h.transpose() + &self.observation_covariance;
        let ph_t = &self.covariance * h.transpose();
        // K = P Hᵀ S⁻¹, solved as Kᵀ = S⁻¹ (P Hᵀ)ᵀ
        let k = robust_spd_solve(&s, &ph_t.transpose())?.transpose();
        let innovation = observation - h * &self.mean_state;
        self.mean_state += &k * innovation;
        // Joseph form keeps the covariance symmetric positive semi-definite.
        let n = self.mean_state.len();
        let i_kh = DMatrix::<f64>::identity(n, n) - &k * h;
        self.covariance = symmetrize(
            &(&i_kh * &self.covariance * i_kh.transpose()
                + &k * &self.observation_covariance * k.transpose()),
        );
        Ok(())
    }
    fn get_estimate(&self) -> DVector<f64> {
        self.mean_state.clone()
    }
    fn get_certainty(&self) -> DMatrix<f64> {
        self.covariance.clone()
    }
}

/// Merwe scaled sigma-point parameters.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnscentedParameters {
    pub alpha: f64,
    pub beta: f64,
    pub kappa: f64,
}

impl Default for UnscentedParameters {
    fn default() -> Self {
        UnscentedParameters {
            alpha: 0.1,
            beta: 2.0,
            kappa: 1.0,
        }
    }
}

/// Unscented Kalman Filter implementation
pub struct UnscentedKalmanFilter<'a> {
    mean_state: DVector<f64>,
    covariance: DMatrix<f64>,
    transition: &'a dyn TransitionModel,
    observation: &'a dyn ObservationModel,
    process_noise: DMatrix<f64>,
    observation_noise: DMatrix<f64>,
    lambda: f64,
    state_size: usize,
    weights_mean: DVector<f64>,
    weights_cov: DVector<f64>,
}
impl Debug for UnscentedKalmanFilter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UKF")
            .field("mean_state", &self.mean_state)
            .field("covariance", &self.covariance)
            .field("process_noise", &self.process_noise)
            .field("lambda", &self.lambda)
            .field("state_size", &self.state_size)
            .finish()
    }
}
impl Display for UnscentedKalmanFilter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "UnscentedKalmanFilter(n = {}, lambda = {:.4}, mean = {:?})",
            self.state_size,
            self.lambda,
            self.mean_state.as_slice()
        )
    }
}
impl<'a> UnscentedKalmanFilter<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mean: DVector<f64>,
        covariance: DMatrix<f64>,
        transition: &'a dyn TransitionModel,
        transition_covariance: &DMatrix<f64>,
        observation: &'a dyn ObservationModel,
        observation_covariance: &DMatrix<f64>,
        parameters: UnscentedParameters,
    ) -> Result<Self> {
        let state_size = transition.dimension();
        check_prior(&mean, &covariance, state_size)?;
        check_observation_model(observation, state_size, &mean)?;
        check_noise(
            transition_covariance,
            state_size,
            observation_covariance,
            observation.dimension(),
        )?;
        let UnscentedParameters { alpha, beta, kappa } = parameters;
        if !(alpha > 0.0) {
            return Err(FilterError::InvalidParameter {
                name: "alpha",
                value: alpha,
                reason: "must be positive",
            });
        }
        let n = state_size as f64;
        let lambda = alpha * alpha * (n + kappa) - n;
        if !(n + lambda > 0.0) {
            return Err(FilterError::InvalidParameter {
                name: "kappa",
                value: kappa,
                reason: "n + lambda must be positive",
            });
        }
        let mut weights_mean = DVector::zeros(2 * state_size + 1);
        let mut weights_cov = DVector::zeros(2 * state_size + 1);
        weights_mean[0] = lambda / (n + lambda);
        weights_cov[0] = lambda / (n + lambda) + (1.0 - alpha * alpha + beta);
        for i in 1..(2 * state_size + 1) {
            let w = 1.0 / (2.0 * (n + lambda));
            weights_mean[i] = w;
            weights_cov[i] = w;
        }
        Ok(UnscentedKalmanFilter {
            mean_state: mean,
            covariance,
            transition,
            observation,
            process_noise: transition_covariance.clone(),
            observation_noise: observation_covariance.clone(),
            lambda,
            state_size,
            weights_mean,
            weights_cov,
        })
    }

    pub fn from_model<M: StateSpaceModel + ?Sized>(
        model: &'a M,
        mean: DVector<f64>,
        covariance: DMatrix<f64>,
        parameters: UnscentedParameters,
    ) -> Result<Self> {
        Self::new(
            mean,
            covariance,
            model.transition(),
            model.transition_covariance(),
            model.observation(),
            model.observation_covariance(),
            parameters,
        )
    }

    pub fn get_sigma_points(&self) -> DMatrix<f64> {
        let p = (self.state_size as f64 + self.lambda) * self.covariance.clone();
        let sqrt_p = matrix_square_root(&p);
        let mu = self.mean_state.clone();
        let mut pts = DMatrix::<f64>::zeros(self.state_size, 2 * self.state_size + 1);
        pts.column_mut(0).copy_from(&mu);
        for i in 0..sqrt_p.ncols() {
            pts.column_mut(i + 1).copy_from(&(&mu + sqrt_p.column(i)));
            pts.column_mut(i + 1 + self.state_size)
                .copy_from(&(&mu - sqrt_p.column(i)));
        }
        pts
    }

    fn weighted_mean(&self, points: &DMatrix<f64>) -> DVector<f64> {
        points * &self.weights_mean
    }

    fn weighted_covariance(
        &self,
        left: &DMatrix<f64>,
        left_mean: &DVector<f64>,
        right: &DMatrix<f64>,
        right_mean: &DVector<f64>,
    ) -> DMatrix<f64> {
        let mut out = DMatrix::<f64>::zeros(left.nrows(), right.nrows());
        for (i, (l, r)) in left.column_iter().zip(right.column_iter()).enumerate() {
            out += self.weights_cov[i] * (l - left_mean) * (r - right_mean).transpose();
        }
        out
    }
}

impl BayesFilter for UnscentedKalmanFilter<'_> {
    fn predict(&mut self) {
        let sigma_points = self.transition.propagate_columns(&self.get_sigma_points());
        let mu_bar = self.weighted_mean(&sigma_points);
        let p_bar = self.weighted_covariance(&sigma_points, &mu_bar, &sigma_points, &mu_bar)
            + &self.process_noise;
        self.mean_state = mu_bar;
        self.covariance = symmetrize(&p_bar);
    }
    fn update(&mut self, observation: &DVector<f64>) -> Result<()> {
        let sigma_points = self.get_sigma_points();
        let measurement_sigma_points = self.observation.expected_columns(&sigma_points);
        let z_hat = self.weighted_mean(&measurement_sigma_points);
        let s = self.weighted_covariance(
            &measurement_sigma_points,
            &z_hat,
            &measurement_sigma_points,
            &z_hat,
        ) + &self.observation_noise;
        let cross_covariance = self.weighted_covariance(
            &sigma_points,
            &self.mean_state,
            &measurement_sigma_points,
            &z_hat,
        );
        let k = robust_spd_solve(&symmetrize(&s), &cross_covariance.transpose())?.transpose();
        self.mean_state += &k * (observation - &z_hat);
        self.covariance -= &k * &s * &k.transpose();
        self.covariance = symmetrize(&self.covariance);
        // Small diagonal regularization keeps the next sigma-point factorization well posed.
        let eps = 1e-9;
        for i in 0..self.state_size {
            self.covariance[(i, i)] += eps;
        }
        Ok(())
    }
    fn get_estimate(&self) -> DVector<f64> {
        self.mean_state.clone()
    }
    fn get_certainty(&self) -> DMatrix<f64> {
        self.covariance.clone()
    }
}

/// Means and covariances of a Gaussian filter at steps `0..=T`.
#[derive(Clone, Debug, Default)]
pub struct GaussianTrack {
    pub means: Vec<DVector<f64>>,
    pub covariances: Vec<DMatrix<f64>>,
}

/// Run a Gaussian filter over `y_1..y_T`, recording the prior as step 0. Missing or non-finite
/// observations only predict.
pub fn run_bayes_filter<F: BayesFilter + ?Sized>(
    filter: &mut F,
    observations: &[Option<DVector<f64>>],
) -> Result<GaussianTrack> {
    let mut track = GaussianTrack {
        means: Vec::with_capacity(observations.len() + 1),
        covariances: Vec::with_capacity(observations.len() + 1),
    };
    track.means.push(filter.get_estimate());
    track.covariances.push(filter.get_certainty());
    for y in observations {
        filter.predict();
        if let Some(y) = y.as_ref().filter(|y| y.iter().all(|v| v.is_finite())) {
            filter.update(y)?;
        }
        track.means.push(filter.get_estimate());
        track.covariances.push(filter.get_certainty());
    }
    Ok(track)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynamics::{LinearTransition, ReversibleReaction};
    use crate::measurements::{LinearObservation, TotalPressureObservation};
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn kalman_update_matches_scalar_formula() {
        let f = LinearTransition::new(DMatrix::identity(1, 1)).unwrap();
        let h = LinearObservation::new(DMatrix::identity(1, 1)).unwrap();
        let mut kf = KalmanFilter::new(
            DVector::from_element(1, 0.0),
            DMatrix::from_element(1, 1, 1.0),
            &f,
            &DMatrix::from_element(1, 1, 1.0),
            &h,
            &DMatrix::from_element(1, 1, 2.0),
        )
        .unwrap();
        kf.predict();
        assert_approx_eq!(kf.get_certainty()[(0, 0)], 2.0, 1e-12);
        kf.update(&DVector::from_element(1, 4.0)).unwrap();
        // gain 2 / (2 + 2) = 0.5
        assert_approx_eq!(kf.get_estimate()[0], 2.0, 1e-12);
        assert_approx_eq!(kf.get_certainty()[(0, 0)], 1.0, 1e-12);
    }

    #[test]
    fn kalman_requires_linear_models() {
        let f = ReversibleReaction::default();
        let h = TotalPressureObservation;
        let result = KalmanFilter::new(
            DVector::from_vec(vec![3.0, 1.0]),
            DMatrix::identity(2, 2),
            &f,
            &DMatrix::identity(2, 2),
            &h,
            &DMatrix::identity(1, 1),
        );
        assert!(matches!(result, Err(FilterError::Config(_))));
    }

    #[test]
    fn ukf_sigma_points_reproduce_mean_and_covariance() {
        let f = ReversibleReaction::default();
        let h = TotalPressureObservation;
        let mean = DVector::from_vec(vec![3.0, 1.0]);
        let cov = DMatrix::from_row_slice(2, 2, &[0.5, 0.1, 0.1, 0.2]);
        let ukf = UnscentedKalmanFilter::new(
            mean.clone(),
            cov.clone(),
            &f,
            &DMatrix::identity(2, 2),
            &h,
            &DMatrix::identity(1, 1),
            UnscentedParameters::default(),
        )
        .unwrap();
        let pts = ukf.get_sigma_points();
        assert_eq!(pts.ncols(), 5);
        let m = ukf.weighted_mean(&pts);
        assert!((&m - &mean).amax() < 1e-9);
        let c = ukf.weighted_covariance(&pts, &m, &pts, &m);
        // Merwe weights put (1 - α² + β) extra on the central point, which sits at the mean.
        assert!((&c - &cov).amax() < 1e-9);
    }

    #[test]
    fn ukf_agrees_with_kalman_on_linear_system() {
        let f = LinearTransition::constant_velocity(1, 0.1);
        let h = LinearObservation::leading_components(1, 2);
        let q = DMatrix::from_row_slice(2, 2, &[1e-3, 0.0, 0.0, 1e-2]);
        let r = DMatrix::from_element(1, 1, 0.5);
        let m0 = DVector::from_vec(vec![0.0, 1.0]);
        let p0 = DMatrix::identity(2, 2);
        let mut kf = KalmanFilter::new(m0.clone(), p0.clone(), &f, &q, &h, &r).unwrap();
        let mut ukf =
            UnscentedKalmanFilter::new(m0, p0, &f, &q, &h, &r, UnscentedParameters::default())
                .unwrap();
        for t in 1..=20 {
            let y = DVector::from_element(1, 0.1 * t as f64 + 0.05 * (t as f64).sin());
            kf.predict();
            ukf.predict();
            kf.update(&y).unwrap();
            ukf.update(&y).unwrap();
        }
        assert!((kf.get_estimate() - ukf.get_estimate()).amax() < 1e-6);
    }

    #[test]
    fn missing_observations_only_predict() {
        let f = LinearTransition::new(DMatrix::identity(1, 1)).unwrap();
        let h = LinearObservation::new(DMatrix::identity(1, 1)).unwrap();
        let mut kf = KalmanFilter::new(
            DVector::from_element(1, 0.0),
            DMatrix::from_element(1, 1, 1.0),
            &f,
            &DMatrix::from_element(1, 1, 0.5),
            &h,
            &DMatrix::from_element(1, 1, 1.0),
        )
        .unwrap();
        let observations = vec![None, Some(DVector::from_element(1, f64::NAN)), None];
        let track = run_bayes_filter(&mut kf, &observations).unwrap();
        assert_eq!(track.means.len(), 4);
        assert_eq!(track.means[3][0], 0.0);
        assert_approx_eq!(track.covariances[3][(0, 0)], 2.5, 1e-12);
    }
}
