//! Sweep runner tests driven through configuration files, as the command line tool uses them.
use robust_smc::config::ExperimentConfig;
use robust_smc::experiment::{run_experiment, summarize, write_csv};
use robust_smc::noise::ObservationNoise;
use robust_smc::sim::{ReversibleReactionModel, SystemConfig, TerrainAidedNavigation};

fn scratch_dir(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("robust_smc_{}_{}", name, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn terrain_sweep_from_a_toml_file() {
    let dir = scratch_dir("tan");
    let path = dir.join("tan.toml");
    let config = ExperimentConfig {
        name: "tan_smoke".to_string(),
        num_runs: 1,
        num_particles: 100,
        contamination: vec![0.1],
        betas: vec![0.05, 0.5],
        output_dir: dir.clone(),
        system: SystemConfig::TerrainAidedNavigation(TerrainAidedNavigation {
            final_time: 1.0,
            observation_std: 20.0,
            noise: ObservationNoise::Explosive {
                probability: 0.0,
                degrees_of_freedom: 0.5,
            },
            ..Default::default()
        }),
        ..Default::default()
    };
    config.to_file(&path).unwrap();
    let loaded = ExperimentConfig::from_file(&path).unwrap();
    assert_eq!(loaded, config);

    let records = run_experiment(&loaded, true).unwrap();
    // bpf, apf, t_bpf, 2 robust_bpf, 2 robust_apf, ukf, over 6 state dimensions
    assert_eq!(records.len(), 8 * 6);
    assert!(records.iter().any(|r| r.variant == "ukf"));
    assert!(records.iter().all(|r| r.contamination == 0.1));
    let robust: Vec<_> = records.iter().filter(|r| r.variant == "robust_apf").collect();
    assert_eq!(robust.len(), 2 * 6);
    assert!(robust.iter().all(|r| r.beta.is_some()));

    let runs_path = dir.join("runs.csv");
    write_csv(&runs_path, &records).unwrap();
    write_csv(dir.join("summary.csv"), &summarize(&records)).unwrap();
    let contents = std::fs::read_to_string(&runs_path).unwrap();
    assert!(contents.starts_with("system,contamination,variant,beta,run,dimension"));
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn reaction_sweep_uses_the_unscented_baseline() {
    let config = ExperimentConfig {
        num_runs: 2,
        num_particles: 100,
        contamination: vec![0.0, 0.3],
        betas: vec![0.1],
        system: SystemConfig::ReversibleReaction(ReversibleReactionModel {
            final_time: 2.0,
            ..Default::default()
        }),
        ..Default::default()
    };
    let records = run_experiment(&config, false).unwrap();
    assert_eq!(records.len(), 2 * 2 * 6 * 2);
    let ukf_rows = records.iter().filter(|r| r.variant == "ukf").count();
    assert_eq!(ukf_rows, 2 * 2 * 2);
    assert!(records.iter().filter(|r| !r.failed).all(|r| r.mse >= 0.0));
}

#[test]
fn yaml_and_json_configs_agree() {
    let dir = scratch_dir("formats");
    let config = ExperimentConfig::default();
    config.to_file(dir.join("c.yaml")).unwrap();
    config.to_file(dir.join("c.json")).unwrap();
    let from_yaml = ExperimentConfig::from_file(dir.join("c.yaml")).unwrap();
    let from_json = ExperimentConfig::from_file(dir.join("c.json")).unwrap();
    assert_eq!(from_yaml, from_json);
    assert_eq!(from_json, config);
    std::fs::remove_dir_all(&dir).ok();
}
