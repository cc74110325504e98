//! The sequential Monte Carlo driver.
//!
//! [`ParticleFilter`] runs one filtering pass over an observation sequence. The algorithm
//! variant is a composition of three independent choices held in [`ParticleFilterConfig`]:
//!
//! - the sampler ([`SamplerKind::Bootstrap`] or [`SamplerKind::Auxiliary`]),
//! - the likelihood family ([`LikelihoodKind`]: Gaussian, Student-t, or β-divergence),
//! - the resampling scheme and the policy deciding when to resample.
//!
//! Each step predicts every particle through `f` plus process noise, reweights with the current
//! observation, resamples per policy, and records the population. Steps whose observation is
//! missing (`None` or non-finite) only predict. The record for step 0 is the initial cloud, so a
//! pass over T observations leaves T + 1 records.
//!
//! ```text
//!   Initialized --sample()--> Completed
//!        |                        |
//!        | (weights collapse)     | reset()
//!        v                        v
//!      Failed --reset()-----> Initialized
//! ```

use crate::errors::{FilterError, Result};
use crate::dynamics::TransitionModel;
use crate::likelihood::{Likelihood, LikelihoodKind};
use crate::measurements::{ObservationModel, check_observation_model};
use crate::noise::GaussianNoise;
use crate::particle::{ParticleAveragingStrategy, ParticleSet, StepSummary};
use crate::resampling::{ParticleResamplingStrategy, Resampler, ResamplingPolicy};
use crate::sim::StateSpaceModel;

use log::{debug, trace, warn};
use nalgebra::{DMatrix, DVector};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};
use std::path::Path;

/// Effective sample sizes below this many particles are reported as a warning.
const LOW_ESS_WARNING: f64 = 2.0;

/// Proposal scheme of the particle filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SamplerKind {
    /// Propose from the transition, weight by the likelihood.
    Bootstrap,
    /// Pre-select ancestors with a look-ahead weight at `f(x)`, then correct.
    Auxiliary,
}
impl Default for SamplerKind {
    fn default() -> Self {
        SamplerKind::Bootstrap
    }
}

/// Configuration of a particle filter run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParticleFilterConfig {
    pub num_particles: usize,
    pub seed: u64,
    pub sampler: SamplerKind,
    pub likelihood: LikelihoodKind,
    pub resampling: ParticleResamplingStrategy,
    pub policy: ResamplingPolicy,
    pub averaging: ParticleAveragingStrategy,
}

impl Default for ParticleFilterConfig {
    fn default() -> Self {
        Self {
            num_particles: 1000,
            seed: 42,
            sampler: SamplerKind::Bootstrap,
            likelihood: LikelihoodKind::Gaussian,
            resampling: ParticleResamplingStrategy::Systematic,
            policy: ResamplingPolicy::Always,
            averaging: ParticleAveragingStrategy::WeightedAverage,
        }
    }
}

impl ParticleFilterConfig {
    pub fn bootstrap(num_particles: usize, seed: u64) -> Self {
        Self {
            num_particles,
            seed,
            ..Default::default()
        }
    }
    pub fn auxiliary(num_particles: usize, seed: u64) -> Self {
        Self {
            num_particles,
            seed,
            sampler: SamplerKind::Auxiliary,
            ..Default::default()
        }
    }
    pub fn with_likelihood(mut self, likelihood: LikelihoodKind) -> Self {
        self.likelihood = likelihood;
        self
    }
    pub fn with_policy(mut self, policy: ResamplingPolicy) -> Self {
        self.policy = policy;
        self
    }
    pub fn with_resampling(mut self, resampling: ParticleResamplingStrategy) -> Self {
        self.resampling = resampling;
        self
    }
    pub fn with_averaging(mut self, averaging: ParticleAveragingStrategy) -> Self {
        self.averaging = averaging;
        self
    }
    /// Short variant name such as `bpf`, `t_apf`, or `robust_bpf`.
    pub fn label(&self) -> String {
        let sampler = match self.sampler {
            SamplerKind::Bootstrap => "bpf",
            SamplerKind::Auxiliary => "apf",
        };
        match self.likelihood {
            LikelihoodKind::Gaussian => sampler.to_string(),
            LikelihoodKind::StudentT { .. } => format!("t_{sampler}"),
            LikelihoodKind::BetaDivergence { .. } => format!("robust_{sampler}"),
        }
    }
}

/// Lifecycle of a [`ParticleFilter`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterState {
    /// Holds the initial cloud; `sample()` may be called.
    Initialized,
    /// The pass finished; the trajectory record is available.
    Completed,
    /// The pass stopped because the weights collapsed at `step`.
    Failed { step: usize },
}

/// Everything recorded during a filtering pass, indexed by time step `0..=T`.
#[derive(Clone, Debug, Default)]
pub struct Trajectory {
    samples: Vec<ParticleSet>,
    first_stage_weights: Vec<Option<DVector<f64>>>,
    predicted_observations: Vec<DMatrix<f64>>,
    summaries: Vec<StepSummary>,
    estimates: Vec<DVector<f64>>,
}

impl Trajectory {
    fn with_capacity(records: usize) -> Self {
        Trajectory {
            samples: Vec::with_capacity(records),
            first_stage_weights: Vec::with_capacity(records),
            predicted_observations: Vec::with_capacity(records),
            summaries: Vec::with_capacity(records),
            estimates: Vec::with_capacity(records),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
    /// Particle population recorded at each step (after resampling, if any).
    pub fn samples(&self) -> &[ParticleSet] {
        &self.samples
    }
    /// Normalized first-stage weights of the auxiliary sampler; `None` for bootstrap steps,
    /// step 0, and steps without an observation.
    pub fn first_stage_weights(&self) -> &[Option<DVector<f64>>] {
        &self.first_stage_weights
    }
    /// `h` evaluated on every recorded particle, one `obs_dim × N` matrix per step.
    pub fn predicted_observations(&self) -> &[DMatrix<f64>] {
        &self.predicted_observations
    }
    pub fn summaries(&self) -> &[StepSummary] {
        &self.summaries
    }
    /// Point estimate per step under the configured averaging strategy.
    pub fn estimates(&self) -> &[DVector<f64>] {
        &self.estimates
    }
    /// Weighted mean per step.
    pub fn means(&self) -> Vec<DVector<f64>> {
        self.summaries.iter().map(|s| s.mean.clone()).collect()
    }
    /// Weighted mean of the predicted observations per step.
    pub fn mean_predicted_observations(&self) -> Vec<DVector<f64>> {
        self.predicted_observations
            .iter()
            .zip(self.samples.iter())
            .map(|(h, particles)| h * particles.weights())
            .collect()
    }

    /// Write one row per step: step, observed, resampled, ESS, then mean, 5% and 95% quantiles
    /// per state dimension.
    pub fn to_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        let dim = self.summaries.first().map_or(0, |s| s.mean.len());
        let mut header = vec![
            "step".to_string(),
            "observed".to_string(),
            "resampled".to_string(),
            "ess".to_string(),
        ];
        for prefix in ["mean", "q05", "q95"] {
            header.extend((0..dim).map(|i| format!("{prefix}_{i}")));
        }
        writer.write_record(&header)?;
        for (step, summary) in self.summaries.iter().enumerate() {
            let mut row = vec![
                step.to_string(),
                summary.observed.to_string(),
                summary.resampled.to_string(),
                format!("{:.6}", summary.effective_sample_size),
            ];
            for values in [&summary.mean, &summary.lower, &summary.upper] {
                row.extend(values.iter().map(|v| format!("{v:.8}")));
            }
            writer.write_record(&row)?;
        }
        writer.flush()?;
        Ok(())
    }

    fn push(
        &mut self,
        particles: ParticleSet,
        predicted: DMatrix<f64>,
        summary: StepSummary,
        estimate: DVector<f64>,
        first_stage: Option<DVector<f64>>,
    ) {
        self.samples.push(particles);
        self.predicted_observations.push(predicted);
        self.summaries.push(summary);
        self.estimates.push(estimate);
        self.first_stage_weights.push(first_stage);
    }

    fn clear(&mut self) {
        self.samples.clear();
        self.first_stage_weights.clear();
        self.predicted_observations.clear();
        self.summaries.clear();
        self.estimates.clear();
    }
}

/// Sequential Monte Carlo sampler over a fixed observation sequence.
pub struct ParticleFilter<'a> {
    observations: Vec<Option<DVector<f64>>>,
    transition: &'a dyn TransitionModel,
    observation: &'a dyn ObservationModel,
    process_noise: GaussianNoise,
    likelihood: Box<dyn Likelihood>,
    resampler: Box<dyn Resampler>,
    config: ParticleFilterConfig,
    initial: ParticleSet,
    rng: StdRng,
    state: FilterState,
    trajectory: Trajectory,
}

impl<'a> ParticleFilter<'a> {
    /// Build a filter. Every input is validated here, so a constructed filter can only fail
    /// while sampling through weight degeneracy.
    ///
    /// # Arguments
    /// * `observations` - `y_1..y_T`; `None` marks a missing observation
    /// * `transition` - deterministic dynamics `f`
    /// * `transition_covariance` - process noise covariance, positive semi-definite (zero allowed)
    /// * `observation` - observation function `h`
    /// * `observation_covariance` - observation noise covariance, positive definite
    /// * `initial_particles` - `N × D` initial cloud, one particle per row
    /// * `config` - sampler, likelihood, resampling and seeding choices
    pub fn new(
        observations: Vec<Option<DVector<f64>>>,
        transition: &'a dyn TransitionModel,
        transition_covariance: &DMatrix<f64>,
        observation: &'a dyn ObservationModel,
        observation_covariance: &DMatrix<f64>,
        initial_particles: &DMatrix<f64>,
        config: ParticleFilterConfig,
    ) -> Result<Self> {
        let dim = transition.dimension();
        if initial_particles.nrows() == 0 || config.num_particles == 0 {
            return Err(FilterError::EmptyParticleSet);
        }
        if initial_particles.nrows() != config.num_particles {
            return Err(FilterError::dimension(
                "initial particle count",
                config.num_particles,
                initial_particles.nrows(),
            ));
        }
        if initial_particles.ncols() != dim {
            return Err(FilterError::dimension(
                "initial particle dimension",
                dim,
                initial_particles.ncols(),
            ));
        }
        if initial_particles.iter().any(|v| !v.is_finite()) {
            return Err(FilterError::InvalidParameter {
                name: "initial particles",
                value: f64::NAN,
                reason: "must be finite",
            });
        }
        if transition_covariance.shape() != (dim, dim) {
            return Err(FilterError::dimension(
                "transition covariance",
                dim,
                transition_covariance.nrows().max(transition_covariance.ncols()),
            ));
        }
        check_observation_model(observation, dim, &initial_particles.row(0).transpose())?;
        let obs_dim = observation.dimension();
        if observation_covariance.shape() != (obs_dim, obs_dim) {
            return Err(FilterError::dimension(
                "observation covariance",
                obs_dim,
                observation_covariance.nrows().max(observation_covariance.ncols()),
            ));
        }
        if let Some(y) = observations.iter().flatten().find(|y| y.len() != obs_dim) {
            return Err(FilterError::dimension("observation", obs_dim, y.len()));
        }
        config.policy.validate()?;
        let process_noise = GaussianNoise::new(transition_covariance, "transition covariance")?;
        let likelihood = config.likelihood.build(observation_covariance)?;
        let resampler = config.resampling.resampler();
        let initial = ParticleSet::from_rows(initial_particles)?;
        let trajectory = Trajectory::with_capacity(observations.len() + 1);

        Ok(ParticleFilter {
            observations,
            transition,
            observation,
            process_noise,
            likelihood,
            resampler,
            rng: StdRng::seed_from_u64(config.seed),
            config,
            initial,
            state: FilterState::Initialized,
            trajectory,
        })
    }

    /// Build a filter over a model's current observation sequence.
    pub fn from_model<M: StateSpaceModel + ?Sized>(
        model: &'a M,
        initial_particles: &DMatrix<f64>,
        config: ParticleFilterConfig,
    ) -> Result<Self> {
        Self::new(
            model.observations().to_vec(),
            model.transition(),
            model.transition_covariance(),
            model.observation(),
            model.observation_covariance(),
            initial_particles,
            config,
        )
    }

    pub fn config(&self) -> &ParticleFilterConfig {
        &self.config
    }
    pub fn state(&self) -> FilterState {
        self.state
    }
    pub fn num_particles(&self) -> usize {
        self.initial.len()
    }
    /// Number of filtering steps T.
    pub fn num_steps(&self) -> usize {
        self.observations.len()
    }
    pub fn observations(&self) -> &[Option<DVector<f64>>] {
        &self.observations
    }

    /// Run the filtering pass. Can only be called once per construction or [`reset`](Self::reset).
    pub fn sample(&mut self) -> Result<()> {
        if self.state != FilterState::Initialized {
            return Err(FilterError::AlreadySampled);
        }
        debug!(
            "Sampling {} with {} particles over {} steps",
            self.config.label(),
            self.num_particles(),
            self.num_steps()
        );
        match self.run() {
            Ok(()) => {
                self.state = FilterState::Completed;
                debug!("{} completed {} records", self.config.label(), self.trajectory.len());
                Ok(())
            }
            Err(err) => {
                let step = match &err {
                    FilterError::WeightDegeneracy { step } => *step,
                    _ => self.trajectory.len(),
                };
                warn!("{} failed at step {}: {}", self.config.label(), step, err);
                self.state = FilterState::Failed { step };
                Err(err)
            }
        }
    }

    /// Restore the initial cloud and generator and clear the record, allowing another `sample()`.
    pub fn reset(&mut self) {
        self.rng = StdRng::seed_from_u64(self.config.seed);
        self.trajectory.clear();
        self.state = FilterState::Initialized;
    }

    /// Full record of a completed pass.
    pub fn trajectory(&self) -> Result<&Trajectory> {
        match self.state {
            FilterState::Completed => Ok(&self.trajectory),
            _ => Err(FilterError::NotSampled),
        }
    }
    /// Particle populations `X_0..X_T`.
    pub fn x_samples(&self) -> Result<&[ParticleSet]> {
        Ok(self.trajectory()?.samples())
    }
    /// Point-estimate trajectory under the configured averaging strategy.
    pub fn x_trajectories(&self) -> Result<&[DVector<f64>]> {
        Ok(self.trajectory()?.estimates())
    }
    pub fn predicted_observations(&self) -> Result<&[DMatrix<f64>]> {
        Ok(self.trajectory()?.predicted_observations())
    }

    fn run(&mut self) -> Result<()> {
        let mut particles = self.initial.clone();
        let ess = particles.effective_sample_size();
        self.record(particles.clone(), ess, false, false, None);

        for t in 1..=self.observations.len() {
            let y = self.observations[t - 1]
                .clone()
                .filter(|y| y.iter().all(|v| v.is_finite()));
            particles = match y {
                None => {
                    let predicted = self.predict(particles.states());
                    particles.set_states(predicted);
                    debug!("No usable observation at step {}; predicting only", t);
                    let ess = particles.effective_sample_size();
                    self.record(particles.clone(), ess, false, false, None);
                    particles
                }
                Some(y) => match self.config.sampler {
                    SamplerKind::Bootstrap => self.bootstrap_step(particles, &y, t)?,
                    SamplerKind::Auxiliary => self.auxiliary_step(particles, &y, t)?,
                },
            };
        }
        Ok(())
    }

    /// `f(x_i) + w_i` for every column.
    fn predict(&mut self, states: &DMatrix<f64>) -> DMatrix<f64> {
        let mut predicted = self.transition.propagate_columns(states);
        self.perturb(&mut predicted);
        predicted
    }

    fn perturb(&mut self, states: &mut DMatrix<f64>) {
        if self.process_noise.is_zero() {
            return;
        }
        for mut column in states.column_iter_mut() {
            column += self.process_noise.sample(&mut self.rng);
        }
    }

    fn bootstrap_step(
        &mut self,
        mut particles: ParticleSet,
        y: &DVector<f64>,
        t: usize,
    ) -> Result<ParticleSet> {
        let predicted = self.predict(particles.states());
        particles.set_states(predicted);
        let h = self.observation.expected_columns(particles.states());
        let log_likelihoods = self.likelihood.log_likelihoods(y, &h);
        particles.reweight(&log_likelihoods, t)?;
        Ok(self.finish_step(particles, t, None))
    }

    fn auxiliary_step(
        &mut self,
        particles: ParticleSet,
        y: &DVector<f64>,
        t: usize,
    ) -> Result<ParticleSet> {
        // First stage: look-ahead weight at the noise-free prediction f(x_i).
        let point = self.transition.propagate_columns(particles.states());
        let h_point = self.observation.expected_columns(&point);
        let first_stage_ll = self.likelihood.log_likelihoods(y, &h_point);
        let mut lookahead = particles;
        lookahead.reweight(&first_stage_ll, t)?;
        let first_stage = lookahead.weights().clone();

        let ancestors = self
            .resampler
            .resample(first_stage.as_slice(), &mut self.rng);
        let mut moved = point.select_columns(&ancestors);
        self.perturb(&mut moved);

        // Second stage: correct by the ratio of the true to the look-ahead likelihood.
        let h = self.observation.expected_columns(&moved);
        let second_stage =
            self.likelihood.log_likelihoods(y, &h) - first_stage_ll.select_rows(&ancestors);
        let mut particles = ParticleSet::uniform(moved)?;
        particles.set_log_weights(&second_stage, t)?;
        Ok(self.finish_step(particles, t, Some(first_stage)))
    }

    fn finish_step(
        &mut self,
        particles: ParticleSet,
        t: usize,
        first_stage: Option<DVector<f64>>,
    ) -> ParticleSet {
        let n = particles.len();
        let ess = particles.effective_sample_size();
        if ess < LOW_ESS_WARNING {
            warn!(
                "Effective sample size {:.3} of {} particles at step {}",
                ess, n, t
            );
        }
        let resample = self.config.policy.should_resample(ess, n);
        let particles = if resample {
            let indices = self
                .resampler
                .resample(particles.weights().as_slice(), &mut self.rng);
            particles.select(&indices)
        } else {
            particles
        };
        trace!("step {}: ess = {:.2}, resampled = {}", t, ess, resample);
        self.record(particles.clone(), ess, resample, true, first_stage);
        particles
    }

    fn record(
        &mut self,
        particles: ParticleSet,
        ess: f64,
        resampled: bool,
        observed: bool,
        first_stage: Option<DVector<f64>>,
    ) {
        let predicted = self.observation.expected_columns(particles.states());
        let summary = StepSummary::of(&particles, ess, resampled, observed);
        let estimate = particles.estimate(self.config.averaging);
        self.trajectory
            .push(particles, predicted, summary, estimate, first_stage);
    }
}

impl Debug for ParticleFilter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParticleFilter")
            .field("variant", &self.config.label())
            .field("num_particles", &self.num_particles())
            .field("dimension", &self.initial.dimension())
            .field("num_steps", &self.num_steps())
            .field("state", &self.state)
            .field("records", &self.trajectory.len())
            .finish()
    }
}
