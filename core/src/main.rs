//! ROBUST SMC: contamination sweeps for robust particle filters.
//!
//! - `run`: run the sweep described by a configuration file (TOML/JSON/YAML) and write the
//!   per-run scores and their summary as CSV.
//! - `config`: write a template configuration for one of the benchmark systems.
//! - `filter`: run a single particle filter on a simulated system and write its trajectory.

use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{error, info};
use nalgebra::DMatrix;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};
use std::error::Error;
use std::path::{Path, PathBuf};

use robust_smc::config::ExperimentConfig;
use robust_smc::experiment::{run_experiment, summarize, write_csv};
use robust_smc::sim::{
    ConstantVelocityModel, ReversibleReactionModel, StateSpaceModel, SystemConfig,
    TerrainAidedNavigation,
};
use robust_smc::{
    LikelihoodKind, ParticleFilter, ParticleFilterConfig, ParticleResamplingStrategy,
    SamplerKind,
};

const LONG_ABOUT: &str = "ROBUST SMC: contamination sweeps for robust particle filters.

Bootstrap and auxiliary particle filters are run with Gaussian, Student-t, and beta-divergence
likelihoods on simulated systems whose observations are contaminated with outliers. The sweep
scores every variant by mean squared error, 90% band coverage, and a predictive error.

Use `config` to write a template, edit it, then `run --config <file>`.";

/// Command line arguments
#[derive(Parser)]
#[command(author, version, about = "Contamination sweeps for robust particle filters.", long_about = LONG_ABOUT)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Run the independent runs of a sweep in parallel
    #[arg(long, global = true)]
    parallel: bool,
}

#[derive(Subcommand, Clone)]
enum Command {
    /// Run a sweep from a configuration file
    Run(RunArgs),
    /// Write a template configuration file
    Config(ConfigArgs),
    /// Run one particle filter on a simulated system and write its trajectory as CSV
    Filter(FilterArgs),
}

#[derive(Args, Clone, Debug)]
struct RunArgs {
    /// Configuration file (TOML/JSON/YAML)
    #[arg(short, long)]
    config: PathBuf,
    /// Output directory; overrides the one in the configuration
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Args, Clone, Debug)]
struct ConfigArgs {
    /// Where to write the template; the format follows the extension
    #[arg(short, long)]
    output: PathBuf,
    /// Benchmark system of the template
    #[arg(long, value_enum, default_value_t = SystemChoice::ConstantVelocity)]
    system: SystemChoice,
}

#[derive(Args, Clone, Debug)]
struct FilterArgs {
    /// Output CSV of per-step statistics
    #[arg(short, long)]
    output: PathBuf,
    #[arg(long, value_enum, default_value_t = SystemChoice::ConstantVelocity)]
    system: SystemChoice,
    #[arg(long, value_enum, default_value_t = SamplerKind::Bootstrap)]
    sampler: SamplerKind,
    /// β of the robust likelihood; the Gaussian likelihood is used when absent
    #[arg(long)]
    beta: Option<f64>,
    /// Use a Student-t likelihood with this many degrees of freedom
    #[arg(long, conflicts_with = "beta")]
    degrees_of_freedom: Option<f64>,
    #[arg(long, default_value_t = 0.1)]
    contamination: f64,
    #[arg(short, long, default_value_t = 1000)]
    num_particles: usize,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    #[arg(long, value_enum, default_value_t = ParticleResamplingStrategy::Systematic)]
    resampling: ParticleResamplingStrategy,
    /// Spread of the initial cloud around the true initial state
    #[arg(long, default_value_t = 1.0)]
    prior_std: f64,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SystemChoice {
    ConstantVelocity,
    TerrainAidedNavigation,
    ReversibleReaction,
}

impl SystemChoice {
    fn config(self) -> SystemConfig {
        match self {
            SystemChoice::ConstantVelocity => {
                SystemConfig::ConstantVelocity(ConstantVelocityModel::default())
            }
            SystemChoice::TerrainAidedNavigation => {
                SystemConfig::TerrainAidedNavigation(TerrainAidedNavigation::explosive())
            }
            SystemChoice::ReversibleReaction => {
                SystemConfig::ReversibleReaction(ReversibleReactionModel::default())
            }
        }
    }
}

/// Initialize the logger with the given level and optional file target.
fn init_logger(log_level: &str, log_file: Option<&PathBuf>) -> Result<(), Box<dyn Error>> {
    use std::io::Write;

    let level = log_level.parse::<log::LevelFilter>().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', defaulting to 'info'", log_level);
        log::LevelFilter::Info
    });

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] - {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.args()
        )
    });

    if let Some(log_path) = log_file {
        if let Some(parent) = log_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let target = Box::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)?,
        );
        builder.target(env_logger::Target::Pipe(target));
    }

    builder.try_init()?;
    Ok(())
}

fn run_sweep(args: &RunArgs, parallel: bool) -> Result<(), Box<dyn Error>> {
    let mut config = ExperimentConfig::from_file(&args.config)?;
    if let Some(output) = &args.output {
        config.output_dir = output.clone();
    }
    info!("Loaded configuration from {}", args.config.display());
    let records = run_experiment(&config, parallel)?;
    std::fs::create_dir_all(&config.output_dir)?;
    let records_path = config.output_dir.join(format!("{}_runs.csv", config.name));
    let summary_path = config.output_dir.join(format!("{}_summary.csv", config.name));
    write_csv(&records_path, &records)?;
    write_csv(&summary_path, &summarize(&records))?;
    info!(
        "Wrote {} rows to {} and the summary to {}",
        records.len(),
        records_path.display(),
        summary_path.display()
    );
    Ok(())
}

fn write_template(args: &ConfigArgs) -> Result<(), Box<dyn Error>> {
    let mut config = ExperimentConfig {
        name: args.system.config().name().to_string(),
        system: args.system.config(),
        ..Default::default()
    };
    config.prior_std = Some(config.effective_prior_std());
    config.to_file(&args.output)?;
    info!("Wrote template configuration to {}", args.output.display());
    Ok(())
}

fn run_single_filter(args: &FilterArgs) -> Result<(), Box<dyn Error>> {
    let system = args
        .system
        .config()
        .with_contamination(args.contamination)
        .simulate()?;
    let x0 = system.latent_states()[0].clone();
    let mut rng = StdRng::seed_from_u64(args.seed.wrapping_add(1));
    let initial = DMatrix::from_fn(args.num_particles, x0.len(), |_, j| {
        let z: f64 = StandardNormal.sample(&mut rng);
        x0[j] + args.prior_std * z
    });
    let likelihood = match (args.beta, args.degrees_of_freedom) {
        (Some(beta), _) => LikelihoodKind::BetaDivergence { beta },
        (None, Some(degrees_of_freedom)) => LikelihoodKind::StudentT { degrees_of_freedom },
        (None, None) => LikelihoodKind::Gaussian,
    };
    let config = ParticleFilterConfig {
        sampler: args.sampler,
        ..ParticleFilterConfig::bootstrap(args.num_particles, args.seed)
    }
    .with_likelihood(likelihood)
    .with_resampling(args.resampling);
    let mut filter = ParticleFilter::from_model(&system, &initial, config)?;
    filter.sample()?;
    let trajectory = filter.trajectory()?;
    write_output(&args.output, trajectory)?;
    info!(
        "{} on {}: {} records written to {}",
        filter.config().label(),
        args.system.config().name(),
        trajectory.len(),
        args.output.display()
    );
    Ok(())
}

fn write_output(path: &Path, trajectory: &robust_smc::Trajectory) -> Result<(), Box<dyn Error>> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    trajectory.to_csv(path)?;
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logger(&cli.log_level, cli.log_file.as_ref())?;

    let result = match &cli.command {
        Command::Run(args) => run_sweep(args, cli.parallel),
        Command::Config(args) => write_template(args),
        Command::Filter(args) => run_single_filter(args),
    };
    if let Err(e) = &result {
        error!("{}", e);
    }
    result
}
