//! Experiment configuration files.
//!
//! An [`ExperimentConfig`] describes one sweep: the benchmark system, the contamination levels
//! and β grid to cover, and the particle filter settings shared by every variant. It can be read
//! from and written to JSON, YAML, or TOML; the format is chosen by file extension.

use crate::errors::{FilterError, Result};
use crate::resampling::{ParticleResamplingStrategy, ResamplingPolicy};
use crate::sim::SystemConfig;

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// β values swept for the robust filters unless configured otherwise.
pub const DEFAULT_BETAS: [f64; 10] = [0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.2, 0.5, 0.8];
/// Contamination probabilities swept unless configured otherwise.
pub const DEFAULT_CONTAMINATION: [f64; 10] = [0.0, 0.01, 0.05, 0.1, 0.15, 0.2, 0.25, 0.3, 0.35, 0.4];

/// Settings of a contamination × variant × β sweep.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub name: String,
    pub num_runs: usize,
    pub num_particles: usize,
    /// Seed of the generator that draws per-run filter seeds and initial clouds.
    pub seed: u64,
    pub contamination: Vec<f64>,
    pub betas: Vec<f64>,
    /// Standard deviation of the initial cloud around the true initial state, per dimension.
    /// Uses a per-system default when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prior_std: Option<Vec<f64>>,
    pub student_t_degrees_of_freedom: f64,
    /// Also score the Kalman filter (linear systems) or the unscented Kalman filter.
    pub include_kalman: bool,
    pub resampling: ParticleResamplingStrategy,
    pub output_dir: PathBuf,
    pub policy: ResamplingPolicy,
    pub system: SystemConfig,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        ExperimentConfig {
            name: "beta_sweep".to_string(),
            num_runs: 10,
            num_particles: 1000,
            seed: 24,
            contamination: DEFAULT_CONTAMINATION.to_vec(),
            betas: DEFAULT_BETAS.to_vec(),
            prior_std: None,
            student_t_degrees_of_freedom: crate::likelihood::DEFAULT_DEGREES_OF_FREEDOM,
            include_kalman: true,
            resampling: ParticleResamplingStrategy::Systematic,
            output_dir: PathBuf::from("results"),
            policy: ResamplingPolicy::Always,
            system: SystemConfig::default(),
        }
    }
}

fn config_error<E: std::fmt::Display>(err: E) -> FilterError {
    FilterError::Config(err.to_string())
}

impl ExperimentConfig {
    /// Initial cloud spread used when `prior_std` is not set.
    pub fn effective_prior_std(&self) -> Vec<f64> {
        if let Some(std) = &self.prior_std {
            return std.clone();
        }
        match &self.system {
            SystemConfig::ConstantVelocity(_) => vec![1.0; 4],
            SystemConfig::TerrainAidedNavigation(_) => vec![0.1, 0.1, 1.0, 0.01, 0.01, 0.1],
            SystemConfig::ReversibleReaction(_) => vec![0.1; 2],
        }
    }

    /// Check the ranges of every setting that can be checked without simulating.
    pub fn validate(&self) -> Result<()> {
        if self.num_runs == 0 {
            return Err(FilterError::InvalidParameter {
                name: "num_runs",
                value: 0.0,
                reason: "at least one run is required",
            });
        }
        if self.num_particles == 0 {
            return Err(FilterError::EmptyParticleSet);
        }
        if let Some(&p) = self.contamination.iter().find(|p| !(0.0..=1.0).contains(*p)) {
            return Err(FilterError::InvalidParameter {
                name: "contamination",
                value: p,
                reason: "must lie in [0, 1]",
            });
        }
        if let Some(&b) = self.betas.iter().find(|b| !(0.0..=1.0).contains(*b)) {
            return Err(FilterError::InvalidParameter {
                name: "beta",
                value: b,
                reason: "must lie in [0, 1]",
            });
        }
        if !(self.student_t_degrees_of_freedom > 0.0) {
            return Err(FilterError::InvalidParameter {
                name: "student_t_degrees_of_freedom",
                value: self.student_t_degrees_of_freedom,
                reason: "must be positive",
            });
        }
        if let Some(&s) = self.effective_prior_std().iter().find(|s| !(**s >= 0.0)) {
            return Err(FilterError::InvalidParameter {
                name: "prior_std",
                value: s,
                reason: "must be non-negative",
            });
        }
        self.policy.validate()
    }

    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(config_error)
    }
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(config_error)
    }
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = File::create(path)?;
        let s = serde_yaml::to_string(self).map_err(config_error)?;
        file.write_all(s.as_bytes())?;
        Ok(())
    }
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        serde_yaml::from_reader(file).map_err(config_error)
    }
    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self).map_err(config_error)?;
        file.write_all(s.as_bytes())?;
        Ok(())
    }
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = std::fs::read_to_string(path)?;
        toml::from_str(&s).map_err(config_error)
    }

    /// Write using the format implied by the extension (.json/.yaml/.yml/.toml).
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => self.to_json(p),
            Some("yaml") | Some("yml") => self.to_yaml(p),
            Some("toml") => self.to_toml(p),
            _ => Err(unsupported(p)),
        }
    }
    /// Read using the format implied by the extension (.json/.yaml/.yml/.toml).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => Self::from_json(p),
            Some("yaml") | Some("yml") => Self::from_yaml(p),
            Some("toml") => Self::from_toml(p),
            _ => Err(unsupported(p)),
        }
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

fn unsupported(path: &Path) -> FilterError {
    FilterError::Config(format!(
        "unsupported file extension for {} (expected .json, .yaml, .yml or .toml)",
        path.display()
    ))
}
