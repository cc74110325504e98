//! Simulated systems for testing and benchmarking the estimators.
//!
//! This module provides:
//! - The [`StateSpaceModel`] trait, the read-only view a filter needs of a system
//! - [`SimulatedSystem`], a latent trajectory plus a noisy (possibly contaminated) observation
//!   sequence generated from a transition model and an observation model
//! - Configurations for the benchmark systems: constant velocity tracking, terrain-aided
//!   navigation, and a reversible gas-phase reaction
//!
//! Each simulated system owns its own seeded generator. The latent trajectory `x_0..x_T` is drawn
//! once at construction; [`StateSpaceModel::generate_observations`] draws a fresh observation
//! sequence `y_1..y_T` for that same trajectory ("re-noise").

use crate::dynamics::{LinearTransition, ReversibleReaction, TransitionModel};
use crate::errors::{FilterError, Result};
use crate::linalg::spd_cholesky;
use crate::measurements::{
    LinearObservation, ObservationModel, TerrainObservation, TotalPressureObservation,
    check_observation_model,
};
use crate::noise::{GaussianNoise, ObservationNoise};

use log::debug;
use nalgebra::{DMatrix, DVector};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

/// Read-only description of a state-space system as consumed by the filters.
pub trait StateSpaceModel {
    /// Deterministic part of the dynamics, `f`.
    fn transition(&self) -> &dyn TransitionModel;
    /// Process noise covariance `Q`.
    fn transition_covariance(&self) -> &DMatrix<f64>;
    /// Noise-free observation function, `h`.
    fn observation(&self) -> &dyn ObservationModel;
    /// Nominal observation noise covariance `R`.
    fn observation_covariance(&self) -> &DMatrix<f64>;
    /// Latent trajectory `x_0..x_T`.
    fn latent_states(&self) -> &[DVector<f64>];
    /// Current observation sequence `y_1..y_T`. `None` marks a missing observation.
    fn observations(&self) -> &[Option<DVector<f64>>];
    /// Draw a fresh observation sequence for the same latent trajectory, replacing the stored one.
    fn generate_observations(&mut self) -> Result<Vec<Option<DVector<f64>>>>;

    fn state_dimension(&self) -> usize {
        self.transition().dimension()
    }
    fn observation_dimension(&self) -> usize {
        self.observation().dimension()
    }
    /// Number of filtering steps T.
    fn num_steps(&self) -> usize {
        self.observations().len()
    }
}

/// A latent trajectory and its observations, produced by simulating a transition model.
pub struct SimulatedSystem {
    transition: Box<dyn TransitionModel>,
    transition_covariance: DMatrix<f64>,
    observation: Box<dyn ObservationModel>,
    observation_covariance: DMatrix<f64>,
    observation_noise: GaussianNoise,
    contamination: ObservationNoise,
    states: Vec<DVector<f64>>,
    observations: Vec<Option<DVector<f64>>>,
    rng: StdRng,
}

impl SimulatedSystem {
    /// Simulate `steps` transitions from `initial_state` and draw the first observation sequence.
    ///
    /// Fails if the covariances do not match the model dimensions, if the transition covariance
    /// is not positive semi-definite, or if the observation covariance is not positive definite.
    #[allow(clippy::too_many_arguments)]
    pub fn simulate(
        transition: Box<dyn TransitionModel>,
        transition_covariance: DMatrix<f64>,
        observation: Box<dyn ObservationModel>,
        observation_covariance: DMatrix<f64>,
        contamination: ObservationNoise,
        initial_state: DVector<f64>,
        steps: usize,
        seed: u64,
    ) -> Result<Self> {
        let dim = transition.dimension();
        if initial_state.len() != dim {
            return Err(FilterError::dimension("initial state", dim, initial_state.len()));
        }
        if transition_covariance.nrows() != dim {
            return Err(FilterError::dimension(
                "transition covariance",
                dim,
                transition_covariance.nrows(),
            ));
        }
        check_observation_model(observation.as_ref(), dim, &initial_state)?;
        if observation_covariance.nrows() != observation.dimension() {
            return Err(FilterError::dimension(
                "observation covariance",
                observation.dimension(),
                observation_covariance.nrows(),
            ));
        }
        spd_cholesky(&observation_covariance, "observation covariance")?;
        contamination.validate()?;
        let process_noise = GaussianNoise::new(&transition_covariance, "transition covariance")?;
        let observation_noise = GaussianNoise::new(&observation_covariance, "observation covariance")?;

        let mut rng = StdRng::seed_from_u64(seed);
        let mut states = Vec::with_capacity(steps + 1);
        states.push(initial_state);
        for t in 0..steps {
            let next = transition.propagate(&states[t]) + process_noise.sample(&mut rng);
            states.push(next);
        }
        debug!(
            "Simulated {} steps of a {}-dimensional system (seed {})",
            steps, dim, seed
        );

        let mut system = SimulatedSystem {
            transition,
            transition_covariance,
            observation,
            observation_covariance,
            observation_noise,
            contamination,
            states,
            observations: Vec::new(),
            rng,
        };
        system.generate_observations()?;
        Ok(system)
    }

    pub fn contamination(&self) -> &ObservationNoise {
        &self.contamination
    }
    /// Mark the observation at filtering step `t` (1-based) as missing.
    pub fn drop_observation(&mut self, t: usize) {
        if t >= 1 && t <= self.observations.len() {
            self.observations[t - 1] = None;
        }
    }
    /// Overwrite the observation at filtering step `t` (1-based).
    pub fn set_observation(&mut self, t: usize, value: DVector<f64>) {
        if t >= 1 && t <= self.observations.len() {
            self.observations[t - 1] = Some(value);
        }
    }
}

impl StateSpaceModel for SimulatedSystem {
    fn transition(&self) -> &dyn TransitionModel {
        self.transition.as_ref()
    }
    fn transition_covariance(&self) -> &DMatrix<f64> {
        &self.transition_covariance
    }
    fn observation(&self) -> &dyn ObservationModel {
        self.observation.as_ref()
    }
    fn observation_covariance(&self) -> &DMatrix<f64> {
        &self.observation_covariance
    }
    fn latent_states(&self) -> &[DVector<f64>] {
        &self.states
    }
    fn observations(&self) -> &[Option<DVector<f64>>] {
        &self.observations
    }
    fn generate_observations(&mut self) -> Result<Vec<Option<DVector<f64>>>> {
        let observations = self.states[1..]
            .iter()
            .map(|x| {
                let clean = self.observation.expected(x);
                let noise = self.contamination.sample(&self.observation_noise, &mut self.rng)?;
                Ok(Some(clean + noise))
            })
            .collect::<Result<Vec<_>>>()?;
        self.observations = observations.clone();
        Ok(observations)
    }
}

fn steps_for(final_time: f64, time_step: f64) -> Result<usize> {
    if !(time_step > 0.0) {
        return Err(FilterError::InvalidParameter {
            name: "time_step",
            value: time_step,
            reason: "must be positive",
        });
    }
    if !(final_time >= time_step) {
        return Err(FilterError::InvalidParameter {
            name: "final_time",
            value: final_time,
            reason: "must cover at least one time step",
        });
    }
    // Round before truncating so 10.0 / 0.1 gives 100 steps.
    Ok((final_time / time_step + 1e-9).floor() as usize)
}

fn diagonal_from_std(std: &[f64]) -> DMatrix<f64> {
    DMatrix::from_diagonal(&DVector::from_iterator(
        std.len(),
        std.iter().map(|s| s * s),
    ))
}

/// Nearly-constant-velocity target in the plane observed through its position.
///
/// State `[x, y, vx, vy]`. The process covariance is the integrated white-noise-acceleration
/// covariance `[[dt³/3 I, dt²/2 I], [dt²/2 I, dt I]]` scaled by `process_noise_scale`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstantVelocityModel {
    pub final_time: f64,
    pub time_step: f64,
    pub observation_std: f64,
    pub process_noise_scale: f64,
    pub contamination_probability: f64,
    pub explosion_scale: f64,
    /// Fixed initial state. When absent it is drawn as `[140, 140, 50, 0] ⊙ z + N(0, I)`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_state: Option<Vec<f64>>,
    pub seed: u64,
}

impl Default for ConstantVelocityModel {
    fn default() -> Self {
        ConstantVelocityModel {
            final_time: 10.0,
            time_step: 0.1,
            observation_std: 1.0,
            process_noise_scale: 1.0,
            contamination_probability: 0.05,
            explosion_scale: 10.0,
            initial_state: None,
            seed: 1992,
        }
    }
}

impl ConstantVelocityModel {
    pub fn transition_covariance(&self) -> DMatrix<f64> {
        let dt = self.time_step;
        let mut q = DMatrix::zeros(4, 4);
        for i in 0..2 {
            q[(i, i)] = dt.powi(3) / 3.0;
            q[(i, i + 2)] = dt.powi(2) / 2.0;
            q[(i + 2, i)] = dt.powi(2) / 2.0;
            q[(i + 2, i + 2)] = dt;
        }
        q * self.process_noise_scale
    }

    pub fn simulate(&self) -> Result<SimulatedSystem> {
        let steps = steps_for(self.final_time, self.time_step)?;
        if !(self.process_noise_scale >= 0.0) {
            return Err(FilterError::InvalidParameter {
                name: "process_noise_scale",
                value: self.process_noise_scale,
                reason: "must be non-negative",
            });
        }
        let initial_state = match &self.initial_state {
            Some(x0) => DVector::from_column_slice(x0),
            None => {
                // Separate stream so the drawn start does not shift the simulation noise.
                let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(1));
                let spread = [140.0, 140.0, 50.0, 0.0];
                DVector::from_iterator(
                    4,
                    spread.iter().map(|s| {
                        let a: f64 = StandardNormal.sample(&mut rng);
                        let b: f64 = StandardNormal.sample(&mut rng);
                        s * a + b
                    }),
                )
            }
        };
        SimulatedSystem::simulate(
            Box::new(LinearTransition::constant_velocity(2, self.time_step)),
            self.transition_covariance(),
            Box::new(LinearObservation::leading_components(2, 4)),
            DMatrix::identity(2, 2) * self.observation_std.powi(2),
            ObservationNoise::Impulsive {
                probability: self.contamination_probability,
                scale: self.explosion_scale,
            },
            initial_state,
            steps,
            self.seed,
        )
    }
}

/// What the terrain-aided navigation system measures.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TanObservation {
    /// Height above the terrain, `z - DEM(x, y)`.
    #[default]
    Terrain,
    /// Position `(x, y, z)` directly.
    Linear,
}

/// Terrain-aided navigation of an aircraft flying over a synthetic elevation model.
///
/// State `[x, y, z, vx, vy, vz]` in meters and meters per second.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerrainAidedNavigation {
    pub final_time: f64,
    pub time_step: f64,
    pub observation_std: f64,
    pub observation: TanObservation,
    pub noise: ObservationNoise,
    pub initial_state: Vec<f64>,
    pub process_std: Vec<f64>,
    pub seed: u64,
}

impl Default for TerrainAidedNavigation {
    fn default() -> Self {
        TerrainAidedNavigation {
            final_time: 20.0,
            time_step: 0.1,
            observation_std: 5.0,
            observation: TanObservation::Terrain,
            noise: ObservationNoise::Gaussian,
            initial_state: vec![-3000.0, -19200.0, 1100.0, 211.5, 215.3, 0.0],
            process_std: vec![0.1, 0.1, 0.3, 0.0145, 0.0228, 0.115],
            seed: 1992,
        }
    }
}

impl TerrainAidedNavigation {
    /// Explosive-noise variant: 5% of observations draw Student-t(0.5) noise.
    pub fn explosive() -> Self {
        TerrainAidedNavigation {
            noise: ObservationNoise::Explosive {
                probability: 0.05,
                degrees_of_freedom: 0.5,
            },
            ..Default::default()
        }
    }

    pub fn simulate(&self) -> Result<SimulatedSystem> {
        let steps = steps_for(self.final_time, self.time_step)?;
        if self.process_std.len() != 6 {
            return Err(FilterError::dimension("process_std", 6, self.process_std.len()));
        }
        let observation: Box<dyn ObservationModel> = match self.observation {
            TanObservation::Terrain => Box::new(TerrainObservation),
            TanObservation::Linear => Box::new(LinearObservation::leading_components(3, 6)),
        };
        let obs_dim = observation.dimension();
        SimulatedSystem::simulate(
            Box::new(LinearTransition::constant_velocity(3, self.time_step)),
            diagonal_from_std(&self.process_std),
            observation,
            DMatrix::identity(obs_dim, obs_dim) * self.observation_std.powi(2),
            self.noise.clone(),
            DVector::from_column_slice(&self.initial_state),
            steps,
            self.seed,
        )
    }
}

/// Reversible reaction `2A ⇌ B` observed through the total pressure.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReversibleReactionModel {
    pub final_time: f64,
    pub time_step: f64,
    pub observation_std: f64,
    pub process_std: Vec<f64>,
    pub contamination_probability: f64,
    pub explosion_scale: f64,
    pub initial_state: Vec<f64>,
    pub seed: u64,
}

impl Default for ReversibleReactionModel {
    fn default() -> Self {
        ReversibleReactionModel {
            final_time: 10.0,
            time_step: 0.1,
            observation_std: 0.1,
            process_std: vec![1e-3, 1e-3],
            contamination_probability: 0.0,
            explosion_scale: 10.0,
            initial_state: vec![3.0, 1.0],
            seed: 1992,
        }
    }
}

impl ReversibleReactionModel {
    pub fn simulate(&self) -> Result<SimulatedSystem> {
        let steps = steps_for(self.final_time, self.time_step)?;
        if self.process_std.len() != 2 {
            return Err(FilterError::dimension("process_std", 2, self.process_std.len()));
        }
        SimulatedSystem::simulate(
            Box::new(ReversibleReaction {
                time_step: self.time_step,
                ..Default::default()
            }),
            diagonal_from_std(&self.process_std),
            Box::new(TotalPressureObservation),
            DMatrix::from_element(1, 1, self.observation_std.powi(2)),
            ObservationNoise::Impulsive {
                probability: self.contamination_probability,
                scale: self.explosion_scale,
            },
            DVector::from_column_slice(&self.initial_state),
            steps,
            self.seed,
        )
    }
}

/// Any of the benchmark systems, as selected in an experiment configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "system", rename_all = "snake_case")]
pub enum SystemConfig {
    ConstantVelocity(ConstantVelocityModel),
    TerrainAidedNavigation(TerrainAidedNavigation),
    ReversibleReaction(ReversibleReactionModel),
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig::ConstantVelocity(ConstantVelocityModel::default())
    }
}

impl SystemConfig {
    pub fn simulate(&self) -> Result<SimulatedSystem> {
        match self {
            SystemConfig::ConstantVelocity(m) => m.simulate(),
            SystemConfig::TerrainAidedNavigation(m) => m.simulate(),
            SystemConfig::ReversibleReaction(m) => m.simulate(),
        }
    }
    /// Same system with a different contamination probability.
    pub fn with_contamination(&self, probability: f64) -> Self {
        match self {
            SystemConfig::ConstantVelocity(m) => SystemConfig::ConstantVelocity(ConstantVelocityModel {
                contamination_probability: probability,
                ..m.clone()
            }),
            SystemConfig::TerrainAidedNavigation(m) => {
                SystemConfig::TerrainAidedNavigation(TerrainAidedNavigation {
                    noise: m.noise.with_probability(probability),
                    ..m.clone()
                })
            }
            SystemConfig::ReversibleReaction(m) => {
                SystemConfig::ReversibleReaction(ReversibleReactionModel {
                    contamination_probability: probability,
                    ..m.clone()
                })
            }
        }
    }
    pub fn name(&self) -> &'static str {
        match self {
            SystemConfig::ConstantVelocity(_) => "constant_velocity",
            SystemConfig::TerrainAidedNavigation(_) => "terrain_aided_navigation",
            SystemConfig::ReversibleReaction(_) => "reversible_reaction",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn trajectory_has_one_more_state_than_observations() {
        let system = ConstantVelocityModel {
            final_time: 5.0,
            ..Default::default()
        }
        .simulate()
        .unwrap();
        assert_eq!(system.latent_states().len(), 51);
        assert_eq!(system.observations().len(), 50);
        assert_eq!(system.num_steps(), 50);
        assert_eq!(system.state_dimension(), 4);
        assert_eq!(system.observation_dimension(), 2);
    }

    #[test]
    fn same_seed_gives_same_system() {
        let config = TerrainAidedNavigation::explosive();
        let a = config.simulate().unwrap();
        let b = config.simulate().unwrap();
        assert_eq!(a.latent_states(), b.latent_states());
        assert_eq!(a.observations(), b.observations());
    }

    #[test]
    fn renoise_keeps_the_latent_trajectory() {
        let mut system = ReversibleReactionModel::default().simulate().unwrap();
        let states = system.latent_states().to_vec();
        let first = system.observations().to_vec();
        let second = system.generate_observations().unwrap();
        assert_eq!(system.latent_states(), states.as_slice());
        assert_ne!(first, second);
        assert_eq!(system.observations(), second.as_slice());
    }

    #[test]
    fn zero_process_noise_follows_the_dynamics_exactly() {
        let system = ConstantVelocityModel {
            process_noise_scale: 0.0,
            initial_state: Some(vec![0.0, 0.0, 1.0, -2.0]),
            ..Default::default()
        }
        .simulate()
        .unwrap();
        let last = system.latent_states().last().unwrap();
        assert_approx_eq!(last[0], 10.0, 1e-9);
        assert_approx_eq!(last[1], -20.0, 1e-9);
        assert_eq!(last[2], 1.0);
    }

    #[test]
    fn process_covariance_blocks() {
        let q = ConstantVelocityModel {
            time_step: 0.5,
            ..Default::default()
        }
        .transition_covariance();
        assert_approx_eq!(q[(0, 0)], 0.125 / 3.0, 1e-15);
        assert_approx_eq!(q[(0, 2)], 0.125, 1e-15);
        assert_approx_eq!(q[(3, 3)], 0.5, 1e-15);
        assert_eq!(q[(0, 1)], 0.0);
    }

    #[test]
    fn observation_matrix_must_span_the_state() {
        let result = SimulatedSystem::simulate(
            Box::new(LinearTransition::constant_velocity(2, 0.1)),
            DMatrix::identity(4, 4),
            Box::new(LinearObservation::new(DMatrix::identity(2, 2)).unwrap()),
            DMatrix::identity(2, 2),
            ObservationNoise::Gaussian,
            DVector::zeros(4),
            10,
            0,
        );
        assert!(matches!(
            result,
            Err(FilterError::DimensionMismatch { expected: 4, actual: 2, .. })
        ));
    }

    #[test]
    fn mismatched_process_std_is_rejected() {
        let config = TerrainAidedNavigation {
            process_std: vec![0.1; 4],
            ..Default::default()
        };
        assert!(matches!(
            config.simulate(),
            Err(FilterError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn contamination_override_reaches_each_system() {
        let tan = SystemConfig::TerrainAidedNavigation(TerrainAidedNavigation::explosive());
        match tan.with_contamination(0.2) {
            SystemConfig::TerrainAidedNavigation(m) => {
                assert_eq!(m.noise.contamination_probability(), 0.2)
            }
            _ => unreachable!(),
        }
    }
}
