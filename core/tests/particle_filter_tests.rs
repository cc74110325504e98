//! End-to-end tests of the particle filters on simulated systems.
//!
//! The systems are simulated with fixed seeds, so every assertion here is deterministic. The
//! tolerances on estimation error are loose bounds well above what the filters achieve, meant to
//! catch regressions in the weighting or resampling logic rather than to benchmark accuracy.
use nalgebra::{DMatrix, DVector};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};

use robust_smc::dynamics::LinearTransition;
use robust_smc::kalman::{KalmanFilter, run_bayes_filter};
use robust_smc::measurements::FnObservation;
use robust_smc::resampling::{Resampler, ResamplingPolicy};
use robust_smc::sim::{ConstantVelocityModel, SimulatedSystem, StateSpaceModel};
use robust_smc::{
    FilterError, FilterState, LikelihoodKind, ParticleFilter, ParticleFilterConfig,
    ParticleResamplingStrategy,
};

/// Initial cloud of `n` particles around `x0` with spread `std`.
fn cloud(x0: &DVector<f64>, std: f64, n: usize, seed: u64) -> DMatrix<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    DMatrix::from_fn(n, x0.len(), |_, j| {
        let z: f64 = StandardNormal.sample(&mut rng);
        x0[j] + std * z
    })
}

fn constant_velocity(final_time: f64, contamination: f64, process_noise_scale: f64) -> SimulatedSystem {
    ConstantVelocityModel {
        final_time,
        contamination_probability: contamination,
        process_noise_scale,
        initial_state: Some(vec![0.0, 0.0, 1.0, 0.5]),
        ..Default::default()
    }
    .simulate()
    .unwrap()
}

fn variants(n: usize, seed: u64) -> Vec<ParticleFilterConfig> {
    vec![
        ParticleFilterConfig::bootstrap(n, seed),
        ParticleFilterConfig::auxiliary(n, seed),
        ParticleFilterConfig::bootstrap(n, seed).with_likelihood(LikelihoodKind::student_t()),
        ParticleFilterConfig::bootstrap(n, seed)
            .with_likelihood(LikelihoodKind::BetaDivergence { beta: 0.1 }),
        ParticleFilterConfig::auxiliary(n, seed)
            .with_likelihood(LikelihoodKind::BetaDivergence { beta: 0.1 }),
    ]
}

#[test]
fn weights_are_normalized_at_every_step() {
    let system = constant_velocity(3.0, 0.2, 1.0);
    let initial = cloud(&system.latent_states()[0], 0.5, 200, 1);
    for policy in [
        ResamplingPolicy::Always,
        ResamplingPolicy::EffectiveSampleSize { threshold: 0.5 },
        ResamplingPolicy::Never,
    ] {
        for config in variants(200, 7) {
            let label = config.label();
            let mut pf = ParticleFilter::from_model(&system, &initial, config.with_policy(policy)).unwrap();
            pf.sample().unwrap();
            let trajectory = pf.trajectory().unwrap();
            assert_eq!(trajectory.len(), system.num_steps() + 1);
            for (t, set) in trajectory.samples().iter().enumerate() {
                let total: f64 = set.weights().sum();
                assert!((total - 1.0).abs() < 1e-9, "{label} {policy:?} step {t}: {total}");
                assert!(set.weights().iter().all(|w| *w >= 0.0));
            }
        }
    }
}

#[test]
fn tiny_beta_matches_the_gaussian_filter() {
    let system = constant_velocity(1.0, 0.0, 1.0);
    let initial = cloud(&system.latent_states()[0], 0.5, 300, 2);
    let gaussian = ParticleFilterConfig::bootstrap(300, 5).with_policy(ResamplingPolicy::Never);
    let robust = gaussian
        .clone()
        .with_likelihood(LikelihoodKind::BetaDivergence { beta: 1e-10 });

    let mut a = ParticleFilter::from_model(&system, &initial, gaussian).unwrap();
    let mut b = ParticleFilter::from_model(&system, &initial, robust).unwrap();
    a.sample().unwrap();
    b.sample().unwrap();
    let (ta, tb) = (a.trajectory().unwrap(), b.trajectory().unwrap());
    for (sa, sb) in ta.samples().iter().zip(tb.samples().iter()) {
        assert_eq!(sa.states(), sb.states());
        assert!((sa.weights() - sb.weights()).amax() < 1e-6);
    }
}

#[test]
fn resampling_preserves_the_weighted_mean() {
    let n = 10_000;
    let values: Vec<f64> = (0..n).map(|i| i as f64 / n as f64).collect();
    let raw: Vec<f64> = (0..n).map(|i| ((i % 7) as f64 + 0.5).powi(2)).collect();
    let total: f64 = raw.iter().sum();
    let weights: Vec<f64> = raw.iter().map(|w| w / total).collect();
    let weighted_mean: f64 = values.iter().zip(weights.iter()).map(|(v, w)| v * w).sum();
    for strategy in [
        ParticleResamplingStrategy::Systematic,
        ParticleResamplingStrategy::Stratified,
        ParticleResamplingStrategy::Multinomial,
        ParticleResamplingStrategy::Residual,
    ] {
        let mut rng = StdRng::seed_from_u64(17);
        let indices = strategy.resampler().resample(&weights, &mut rng);
        let resampled_mean: f64 = indices.iter().map(|&i| values[i]).sum::<f64>() / n as f64;
        assert!(
            (resampled_mean - weighted_mean).abs() < 0.02,
            "{strategy:?}: {resampled_mean} vs {weighted_mean}"
        );
    }
}

#[test]
fn always_resampling_leaves_uniform_weights() {
    let system = constant_velocity(2.0, 0.1, 1.0);
    let initial = cloud(&system.latent_states()[0], 0.5, 250, 3);
    let mut pf = ParticleFilter::from_model(&system, &initial, ParticleFilterConfig::bootstrap(250, 3)).unwrap();
    pf.sample().unwrap();
    for (set, summary) in pf.x_samples().unwrap().iter().zip(pf.trajectory().unwrap().summaries()) {
        assert!((set.effective_sample_size() - 250.0).abs() < 1e-6);
        assert_eq!(summary.resampled, summary.observed);
        assert!(summary.effective_sample_size <= 250.0 + 1e-6);
    }
}

#[test]
fn same_seed_reproduces_the_run() {
    let system = constant_velocity(2.0, 0.1, 1.0);
    let initial = cloud(&system.latent_states()[0], 0.5, 100, 4);
    for config in variants(100, 11) {
        let mut a = ParticleFilter::from_model(&system, &initial, config.clone()).unwrap();
        let mut b = ParticleFilter::from_model(&system, &initial, config.clone()).unwrap();
        a.sample().unwrap();
        b.sample().unwrap();
        assert_eq!(a.x_trajectories().unwrap(), b.x_trajectories().unwrap());

        let other = ParticleFilterConfig { seed: 12, ..config };
        let mut c = ParticleFilter::from_model(&system, &initial, other).unwrap();
        c.sample().unwrap();
        assert_ne!(a.x_trajectories().unwrap(), c.x_trajectories().unwrap());
    }
}

#[test]
fn reset_replays_the_same_pass() {
    let system = constant_velocity(1.0, 0.0, 1.0);
    let initial = cloud(&system.latent_states()[0], 0.5, 100, 5);
    let mut pf = ParticleFilter::from_model(&system, &initial, ParticleFilterConfig::auxiliary(100, 2)).unwrap();
    pf.sample().unwrap();
    let first = pf.x_trajectories().unwrap().to_vec();
    pf.reset();
    assert_eq!(pf.state(), FilterState::Initialized);
    assert!(matches!(pf.trajectory(), Err(FilterError::NotSampled)));
    pf.sample().unwrap();
    assert_eq!(pf.x_trajectories().unwrap(), first.as_slice());
}

#[test]
fn tracks_constant_velocity_without_process_noise() {
    let system = constant_velocity(5.0, 0.0, 0.0);
    assert_eq!(system.num_steps(), 50);
    let initial = cloud(&system.latent_states()[0], 0.5, 500, 6);
    let mut pf = ParticleFilter::from_model(&system, &initial, ParticleFilterConfig::bootstrap(500, 6)).unwrap();
    pf.sample().unwrap();
    let truth = system.latent_states();
    let estimates = pf.x_trajectories().unwrap();
    assert_eq!(estimates.len(), truth.len());
    for d in 0..2 {
        let mse: f64 = truth
            .iter()
            .zip(estimates.iter())
            .map(|(x, m)| (x[d] - m[d]).powi(2))
            .sum::<f64>()
            / truth.len() as f64;
        // Observation noise has unit standard deviation.
        assert!(mse.sqrt() < 1.0, "dimension {d}: rmse {}", mse.sqrt());
    }
}

#[test]
fn robust_weights_ignore_a_gross_outlier() {
    let mut system = constant_velocity(5.0, 0.0, 1.0);
    let t = 25;
    let clean = system.observations()[t - 1].clone().unwrap();
    system.set_observation(t, clean.add_scalar(1000.0));
    let initial = cloud(&system.latent_states()[0], 0.5, 500, 8);

    let mut vanilla = ParticleFilter::from_model(&system, &initial, ParticleFilterConfig::bootstrap(500, 8)).unwrap();
    let robust_config = ParticleFilterConfig::bootstrap(500, 8)
        .with_likelihood(LikelihoodKind::BetaDivergence { beta: 0.1 });
    let mut robust = ParticleFilter::from_model(&system, &initial, robust_config).unwrap();
    vanilla.sample().unwrap();
    robust.sample().unwrap();

    let vanilla_ess = vanilla.trajectory().unwrap().summaries()[t].effective_sample_size;
    let robust_ess = robust.trajectory().unwrap().summaries()[t].effective_sample_size;
    assert!(vanilla_ess < 2.0, "vanilla ess {vanilla_ess}");
    assert!(robust_ess > 250.0, "robust ess {robust_ess}");

    let truth = &system.latent_states()[t];
    let robust_error = (robust.x_trajectories().unwrap()[t].rows(0, 2) - truth.rows(0, 2)).norm();
    assert!(robust_error < 5.0, "robust error {robust_error}");

    // Jump of the position estimate across the outlier step.
    let jump = |estimates: &[DVector<f64>]| (estimates[t].rows(0, 2) - estimates[t - 1].rows(0, 2)).norm();
    let vanilla_jump = jump(vanilla.x_trajectories().unwrap());
    let robust_jump = jump(robust.x_trajectories().unwrap());
    assert!(
        robust_jump < vanilla_jump,
        "robust jump {robust_jump}, vanilla jump {vanilla_jump}"
    );
}

#[test]
fn invalid_likelihoods_fail_with_weight_degeneracy() {
    let system = constant_velocity(1.0, 0.0, 1.0);
    let observation = FnObservation::new(2, 4, |_x: &DVector<f64>| DVector::from_element(2, f64::NAN));
    let initial = cloud(&system.latent_states()[0], 0.5, 50, 9);
    let mut pf = ParticleFilter::new(
        system.observations().to_vec(),
        system.transition(),
        system.transition_covariance(),
        &observation,
        system.observation_covariance(),
        &initial,
        ParticleFilterConfig::bootstrap(50, 9),
    )
    .unwrap();
    let err = pf.sample().unwrap_err();
    assert!(matches!(err, FilterError::WeightDegeneracy { step: 1 }));
    assert_eq!(pf.state(), FilterState::Failed { step: 1 });
    assert!(pf.trajectory().is_err());
    assert!(matches!(pf.sample(), Err(FilterError::AlreadySampled)));
}

#[test]
fn missing_observations_only_predict() {
    let mut system = constant_velocity(2.0, 0.0, 1.0);
    system.drop_observation(5);
    system.set_observation(6, DVector::from_element(2, f64::NAN));
    let initial = cloud(&system.latent_states()[0], 0.5, 100, 10);
    let mut pf = ParticleFilter::from_model(&system, &initial, ParticleFilterConfig::bootstrap(100, 10)).unwrap();
    pf.sample().unwrap();
    let trajectory = pf.trajectory().unwrap();
    for t in [5, 6] {
        let summary = &trajectory.summaries()[t];
        assert!(!summary.observed && !summary.resampled, "step {t}");
        assert_eq!(trajectory.samples()[t].weights(), trajectory.samples()[t - 1].weights());
        assert_ne!(trajectory.samples()[t].states(), trajectory.samples()[t - 1].states());
    }
    assert!(trajectory.summaries()[7].observed);
}

#[test]
fn particle_filters_agree_with_the_kalman_filter_on_a_linear_system() {
    let system = constant_velocity(3.0, 0.0, 1.0);
    let x0 = system.latent_states()[0].clone();
    let initial = cloud(&x0, 0.5, 2000, 12);

    let mut kf = KalmanFilter::from_model(&system, x0.clone(), DMatrix::identity(4, 4) * 0.25).unwrap();
    let track = run_bayes_filter(&mut kf, system.observations()).unwrap();

    for config in [
        ParticleFilterConfig::bootstrap(2000, 13),
        ParticleFilterConfig::auxiliary(2000, 13),
    ] {
        let label = config.label();
        let mut pf = ParticleFilter::from_model(&system, &initial, config).unwrap();
        pf.sample().unwrap();
        let means = pf.trajectory().unwrap().means();
        assert_eq!(means.len(), track.means.len());
        for (t, (m, k)) in means.iter().zip(track.means.iter()).enumerate() {
            for d in 0..4 {
                let tolerance = if d < 2 { 0.5 } else { 1.0 };
                assert!(
                    (m[d] - k[d]).abs() < tolerance,
                    "{label} step {t} dim {d}: {} vs {}",
                    m[d],
                    k[d]
                );
            }
        }
    }
}

#[test]
fn linear_transition_matches_the_simulated_dynamics() {
    let system = constant_velocity(1.0, 0.0, 0.0);
    let f = LinearTransition::constant_velocity(2, 0.1);
    for w in system.latent_states().windows(2) {
        let predicted = robust_smc::dynamics::TransitionModel::propagate(&f, &w[0]);
        assert!((predicted - &w[1]).amax() < 1e-12);
    }
}
