//! Contamination sweeps comparing particle filter variants.
//!
//! For every contamination level the benchmark system is simulated once (the latent trajectory
//! only depends on the simulator seed), then each run draws a fresh observation sequence, a
//! filter seed, and an initial cloud around the true initial state. Every variant of a run sees
//! the same observations, seed, and cloud:
//!
//! - `bpf` and `apf`: Gaussian likelihood,
//! - `t_bpf`: Student-t likelihood,
//! - `robust_bpf` and `robust_apf`: β-divergence likelihood for each β of the grid,
//! - optionally `kalman` (linear systems) or `ukf` (nonlinear systems).
//!
//! Runs are prepared sequentially from one seeded generator, so the results do not depend on
//! whether the runs are then executed in parallel.

use crate::config::ExperimentConfig;
use crate::errors::{FilterError, Result};
use crate::filter::{ParticleFilter, ParticleFilterConfig};
use crate::kalman::{run_bayes_filter, KalmanFilter, UnscentedKalmanFilter, UnscentedParameters};
use crate::likelihood::LikelihoodKind;
use crate::metrics::{score_gaussian_track, score_trajectory, FilterScores};
use crate::sim::{SimulatedSystem, StateSpaceModel};

use std::collections::BTreeMap;
use std::path::Path;

use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Upper bound (exclusive) of the per-run filter seeds.
const MAX_RUN_SEED: u64 = 1_000_000;

/// One score row: a variant on one run, for one state dimension.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub system: String,
    pub contamination: f64,
    pub variant: String,
    pub beta: Option<f64>,
    pub run: usize,
    pub dimension: usize,
    pub mse: f64,
    pub coverage: f64,
    pub predictive: f64,
    /// The estimator broke down numerically; the scores are NaN.
    pub failed: bool,
}

/// Averages over the runs of one (contamination, variant, β, dimension) cell.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariantSummary {
    pub system: String,
    pub contamination: f64,
    pub variant: String,
    pub beta: Option<f64>,
    pub dimension: usize,
    pub runs: usize,
    pub failures: usize,
    pub mean_mse: f64,
    pub mean_coverage: f64,
    pub median_predictive: f64,
}

/// Everything a run needs, drawn before any filter executes.
struct RunInput {
    run: usize,
    seed: u64,
    observations: Vec<Option<DVector<f64>>>,
    initial_particles: DMatrix<f64>,
}

#[derive(Clone, Copy)]
enum Baseline {
    Kalman,
    Unscented,
}

/// Particle filter variants of the sweep, without their run seed.
pub fn filter_variants(config: &ExperimentConfig) -> Vec<ParticleFilterConfig> {
    let bootstrap = ParticleFilterConfig::bootstrap(config.num_particles, 0)
        .with_resampling(config.resampling)
        .with_policy(config.policy);
    let auxiliary = ParticleFilterConfig::auxiliary(config.num_particles, 0)
        .with_resampling(config.resampling)
        .with_policy(config.policy);
    let mut variants = vec![
        bootstrap.clone(),
        auxiliary.clone(),
        bootstrap.clone().with_likelihood(LikelihoodKind::StudentT {
            degrees_of_freedom: config.student_t_degrees_of_freedom,
        }),
    ];
    for &beta in &config.betas {
        variants.push(bootstrap.clone().with_likelihood(LikelihoodKind::BetaDivergence { beta }));
    }
    for &beta in &config.betas {
        variants.push(auxiliary.clone().with_likelihood(LikelihoodKind::BetaDivergence { beta }));
    }
    variants
}

fn baseline_for(system: &SimulatedSystem) -> Baseline {
    if system.transition().matrix().is_some() && system.observation().matrix().is_some() {
        Baseline::Kalman
    } else {
        Baseline::Unscented
    }
}

/// Draw `num_particles` rows `x0 + std ⊙ z` with `z` standard normal.
fn initial_cloud<R: Rng + ?Sized>(
    x0: &DVector<f64>,
    prior_std: &[f64],
    num_particles: usize,
    rng: &mut R,
) -> DMatrix<f64> {
    DMatrix::from_fn(num_particles, x0.len(), |_, j| {
        let z: f64 = rng.sample(StandardNormal);
        x0[j] + prior_std[j] * z
    })
}

fn is_numerical_failure(err: &FilterError) -> bool {
    matches!(
        err,
        FilterError::WeightDegeneracy { .. }
            | FilterError::NotPositiveDefinite(_)
            | FilterError::NotPositiveSemiDefinite(_)
    )
}

struct RowContext<'c> {
    system: &'c str,
    contamination: f64,
    run: usize,
    dimension: usize,
}

fn rows(
    ctx: &RowContext<'_>,
    variant: String,
    beta: Option<f64>,
    outcome: Result<FilterScores>,
) -> Result<Vec<RunRecord>> {
    let scores = match outcome {
        Ok(scores) => Some(scores),
        Err(err) if is_numerical_failure(&err) => {
            warn!(
                "{} failed on run {} at contamination {}: {}",
                variant, ctx.run, ctx.contamination, err
            );
            None
        }
        Err(err) => return Err(err),
    };
    Ok((0..ctx.dimension)
        .map(|d| RunRecord {
            system: ctx.system.to_string(),
            contamination: ctx.contamination,
            variant: variant.clone(),
            beta,
            run: ctx.run,
            dimension: d,
            mse: scores.as_ref().map_or(f64::NAN, |s| s.mse[d]),
            coverage: scores.as_ref().map_or(f64::NAN, |s| s.coverage[d]),
            predictive: scores.as_ref().map_or(f64::NAN, |s| s.predictive),
            failed: scores.is_none(),
        })
        .collect())
}

fn run_particle_filter(
    system: &SimulatedSystem,
    input: &RunInput,
    variant: ParticleFilterConfig,
) -> Result<FilterScores> {
    let mut filter = ParticleFilter::new(
        input.observations.clone(),
        system.transition(),
        system.transition_covariance(),
        system.observation(),
        system.observation_covariance(),
        &input.initial_particles,
        ParticleFilterConfig {
            seed: input.seed,
            ..variant
        },
    )?;
    filter.sample()?;
    score_trajectory(system.latent_states(), filter.trajectory()?, &input.observations)
}

fn run_baseline(
    system: &SimulatedSystem,
    input: &RunInput,
    baseline: Baseline,
    prior_std: &[f64],
) -> Result<FilterScores> {
    let mean = system.latent_states()[0].clone();
    let covariance = DMatrix::from_diagonal(&DVector::from_iterator(
        prior_std.len(),
        prior_std.iter().map(|s| s * s),
    ));
    let track = match baseline {
        Baseline::Kalman => {
            let mut kf = KalmanFilter::from_model(system, mean, covariance)?;
            run_bayes_filter(&mut kf, &input.observations)?
        }
        Baseline::Unscented => {
            let mut ukf = UnscentedKalmanFilter::from_model(
                system,
                mean,
                covariance,
                UnscentedParameters::default(),
            )?;
            run_bayes_filter(&mut ukf, &input.observations)?
        }
    };
    score_gaussian_track(system.latent_states(), &track, system.observation(), &input.observations)
}

fn run_one(
    config: &ExperimentConfig,
    system: &SimulatedSystem,
    system_name: &str,
    contamination: f64,
    input: &RunInput,
    prior_std: &[f64],
) -> Result<Vec<RunRecord>> {
    debug!("Run {} (seed {}) at contamination {}", input.run, input.seed, contamination);
    let ctx = RowContext {
        system: system_name,
        contamination,
        run: input.run,
        dimension: system.state_dimension(),
    };
    let mut records = Vec::new();
    for variant in filter_variants(config) {
        let label = variant.label();
        let beta = variant.likelihood.beta();
        let outcome = run_particle_filter(system, input, variant);
        records.extend(rows(&ctx, label, beta, outcome)?);
    }
    if config.include_kalman {
        let baseline = baseline_for(system);
        let label = match baseline {
            Baseline::Kalman => "kalman",
            Baseline::Unscented => "ukf",
        };
        let outcome = run_baseline(system, input, baseline, prior_std);
        records.extend(rows(&ctx, label.to_string(), None, outcome)?);
    }
    Ok(records)
}

/// Run every configured run at one contamination level.
///
/// `system` is renoised once per run and `rng` supplies the run seeds and initial clouds; both
/// are advanced sequentially before the runs execute, in parallel when `parallel` is set.
pub fn run_contamination_level(
    config: &ExperimentConfig,
    system: &mut SimulatedSystem,
    contamination: f64,
    rng: &mut StdRng,
    parallel: bool,
) -> Result<Vec<RunRecord>> {
    let prior_std = config.effective_prior_std();
    let x0 = system.latent_states()[0].clone();
    if prior_std.len() != x0.len() {
        return Err(FilterError::dimension("prior_std", x0.len(), prior_std.len()));
    }
    let inputs: Vec<RunInput> = (0..config.num_runs)
        .map(|run| {
            let observations = system.generate_observations()?;
            let seed = rng.random_range(0..MAX_RUN_SEED);
            let initial_particles = initial_cloud(&x0, &prior_std, config.num_particles, rng);
            Ok(RunInput {
                run,
                seed,
                observations,
                initial_particles,
            })
        })
        .collect::<Result<_>>()?;

    let system: &SimulatedSystem = system;
    let name = config.system.name();
    let per_run: Vec<Vec<RunRecord>> = if parallel {
        inputs
            .par_iter()
            .map(|input| run_one(config, system, name, contamination, input, &prior_std))
            .collect::<Result<_>>()?
    } else {
        inputs
            .iter()
            .map(|input| run_one(config, system, name, contamination, input, &prior_std))
            .collect::<Result<_>>()?
    };
    Ok(per_run.into_iter().flatten().collect())
}

/// Run the whole sweep described by `config`.
pub fn run_experiment(config: &ExperimentConfig, parallel: bool) -> Result<Vec<RunRecord>> {
    config.validate()?;
    info!(
        "Experiment '{}': {} on {} contamination levels, {} runs, {} particles, {} betas",
        config.name,
        config.system.name(),
        config.contamination.len(),
        config.num_runs,
        config.num_particles,
        config.betas.len()
    );
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut records = Vec::new();
    for &contamination in &config.contamination {
        let mut system = config.system.with_contamination(contamination).simulate()?;
        let level = run_contamination_level(config, &mut system, contamination, &mut rng, parallel)?;
        let failures = level.iter().filter(|r| r.failed).count();
        info!(
            "Contamination {}: {} rows ({} failed)",
            contamination,
            level.len(),
            failures
        );
        records.extend(level);
    }
    Ok(records)
}

fn median(mut values: Vec<f64>) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    match n {
        0 => f64::NAN,
        _ if n % 2 == 1 => values[n / 2],
        _ => 0.5 * (values[n / 2 - 1] + values[n / 2]),
    }
}

/// Aggregate rows per (contamination, variant, β, dimension), skipping failed runs.
pub fn summarize(records: &[RunRecord]) -> Vec<VariantSummary> {
    type Key = (u64, String, Option<u64>, usize);
    let mut cells: BTreeMap<Key, Vec<&RunRecord>> = BTreeMap::new();
    for r in records {
        let key = (
            r.contamination.to_bits(),
            r.variant.clone(),
            r.beta.map(f64::to_bits),
            r.dimension,
        );
        cells.entry(key).or_default().push(r);
    }
    cells
        .into_values()
        .filter_map(|cell| {
            let first = cell.first()?;
            let ok: Vec<&RunRecord> = cell.iter().copied().filter(|r| !r.failed).collect();
            let n = ok.len() as f64;
            let mean = |f: fn(&RunRecord) -> f64| {
                if ok.is_empty() {
                    f64::NAN
                } else {
                    ok.iter().map(|r| f(r)).sum::<f64>() / n
                }
            };
            Some(VariantSummary {
                system: first.system.clone(),
                contamination: first.contamination,
                variant: first.variant.clone(),
                beta: first.beta,
                dimension: first.dimension,
                runs: cell.len(),
                failures: cell.len() - ok.len(),
                mean_mse: mean(|r| r.mse),
                mean_coverage: mean(|r| r.coverage),
                median_predictive: median(ok.iter().map(|r| r.predictive).collect()),
            })
        })
        .collect()
}

/// Write rows (records or summaries) as CSV with a header.
pub fn write_csv<T: Serialize, P: AsRef<Path>>(path: P, rows: &[T]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{ConstantVelocityModel, SystemConfig};

    fn small_config() -> ExperimentConfig {
        ExperimentConfig {
            name: "smoke".to_string(),
            num_runs: 2,
            num_particles: 50,
            contamination: vec![0.0, 0.2],
            betas: vec![0.1],
            system: SystemConfig::ConstantVelocity(ConstantVelocityModel {
                final_time: 1.0,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn variants_cover_the_beta_grid() {
        let config = ExperimentConfig {
            betas: vec![0.01, 0.1, 0.5],
            ..Default::default()
        };
        let labels: Vec<String> = filter_variants(&config).iter().map(|v| v.label()).collect();
        assert_eq!(labels.len(), 3 + 2 * 3);
        assert_eq!(&labels[..3], &["bpf", "apf", "t_bpf"]);
        assert_eq!(labels.iter().filter(|l| *l == "robust_bpf").count(), 3);
        assert_eq!(labels.iter().filter(|l| *l == "robust_apf").count(), 3);
    }

    #[test]
    fn sweep_emits_one_row_per_variant_run_and_dimension() {
        let config = small_config();
        let records = run_experiment(&config, false).unwrap();
        // (bpf, apf, t_bpf, robust_bpf, robust_apf, kalman) x 2 runs x 4 dims x 2 levels
        assert_eq!(records.len(), 6 * 2 * 4 * 2);
        assert!(records.iter().any(|r| r.variant == "kalman"));
        assert!(records.iter().filter(|r| !r.failed).all(|r| r.mse.is_finite()));
        assert!(records.iter().all(|r| (0.0..=1.0).contains(&r.coverage) || r.failed));
    }

    #[test]
    fn parallel_and_sequential_sweeps_agree() {
        let config = small_config();
        let sequential = run_experiment(&config, false).unwrap();
        let parallel = run_experiment(&config, true).unwrap();
        assert_eq!(sequential, parallel);
    }

    #[test]
    fn summary_averages_runs() {
        let records = run_experiment(&small_config(), false).unwrap();
        let summary = summarize(&records);
        assert_eq!(summary.len(), 6 * 4 * 2);
        assert!(summary.iter().all(|s| s.runs == 2));
    }

    #[test]
    fn records_write_as_csv() {
        let records = run_experiment(&small_config(), false).unwrap();
        let path = std::env::temp_dir().join(format!("robust_smc_records_{}.csv", std::process::id()));
        write_csv(&path, &records).unwrap();
        let mut reader = csv::Reader::from_path(&path).unwrap();
        let back: Vec<RunRecord> = reader.deserialize().collect::<std::result::Result<_, _>>().unwrap();
        assert_eq!(back.len(), records.len());
        std::fs::remove_file(&path).ok();
    }
}
