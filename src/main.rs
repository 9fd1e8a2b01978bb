//! Demo binary for secm-orchestrator
//!
//! Runs a simulated experiment: a deterministic cell model stands in for
//! the potentiostat and an in-memory stage for the SECM, so the full
//! orchestration path can be exercised without instrument hardware.
//!
//! ## Usage
//!
//! ```text
//! secm-orchestrator [experiment.toml]
//! ```
//!
//! Without an argument a built-in demo configuration is used.
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json` — structured JSON output (production)
//! - `RUST_LOG=info` — log level filter

use std::path::Path;

use secm_orchestrator::config::{self, LogFormat, ModeKind, RewardKind};
use secm_orchestrator::env::{ConstantReward, MeasuredOverpotentialReward, RewardStrategy};
use secm_orchestrator::orchestrator::{ConstantPolicy, ControlEpisode, ExperimentIdentity, SweepEpisode};
use secm_orchestrator::{
    init_tracing, metrics, Action, ControlEnvironment, ExperimentOrchestrator, MemorySink,
    SimulatedCell, SimulatedStage,
};
use tracing::info;

const DEMO_CONFIG: &str = r#"
[experiment]
name = "simulated-oer-screen"
substrate_material = "NiFe"

[sweep]
start_potential = 0.0
end_potential = 0.0122
scan_rate = 0.005
step_potential = 0.00244

[positioning]
spot_increment = 2500.0
number_of_experiments = 3
"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::args().nth(1) {
        Some(path) => config::loader::load_from_file(Path::new(&path))?,
        None => config::loader::load_from_str(DEMO_CONFIG, "built-in demo config")?,
    };

    if config.observability.log_format == LogFormat::Json {
        std::env::set_var("LOG_FORMAT", "json");
    }
    let _ = init_tracing();

    // Initialize the metrics registry before any sweep or episode runs.
    metrics::init_metrics()?;

    info!(
        experiment = %config.experiment.name,
        substrate = %config.experiment.substrate_material,
        mode = ?config.orchestrator.mode,
        "starting simulated experiment run"
    );

    let identity = ExperimentIdentity {
        experiment_name: config.experiment.name.clone(),
        experiment_id: config
            .experiment
            .experiment_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", config.experiment.name, config.experiment.batch_id)),
        substrate_material: config.experiment.substrate_material.clone(),
        batch_id: config.experiment.batch_id,
        model_name: match config.orchestrator.mode {
            ModeKind::Control => Some("scripted-ramp".to_string()),
            ModeKind::Sweep => None,
        },
        model_id: None,
    };

    let cell = SimulatedCell::new().with_response(2.0, 0.001);
    let stage = SimulatedStage::new();
    let n_spots = config.positioning.number_of_experiments;

    let (report, records) = match config.orchestrator.mode {
        ModeKind::Sweep => {
            let episode = SweepEpisode::new(
                cell,
                stage,
                config.sweep_parameters(),
                config.positioning.spot_increment,
            );
            let mut orchestrator = ExperimentOrchestrator::new(episode, MemorySink::new(), identity)
                .with_failure_policy(config.orchestrator.failure_policy);
            let report = orchestrator.run(n_spots).await?;
            let (_, sink) = orchestrator.into_parts();
            (report, sink.len())
        }
        ModeKind::Control => {
            let reward: Box<dyn RewardStrategy> = match config.control.reward {
                RewardKind::Measured => Box::new(MeasuredOverpotentialReward::new(
                    config.control.target_overpotential,
                    config.sweep_parameters(),
                )?),
                RewardKind::Constant => Box::new(ConstantReward::default()),
            };
            let env = ControlEnvironment::new(cell, stage, config.env_parameters(), reward);
            let episode = ControlEpisode::new(env, Box::new(ConstantPolicy::new(Action::Increase)));
            let mut orchestrator = ExperimentOrchestrator::new(episode, MemorySink::new(), identity)
                .with_failure_policy(config.orchestrator.failure_policy);
            let report = orchestrator.run(n_spots).await?;
            let (_, sink) = orchestrator.into_parts();
            (report, sink.len())
        }
    };

    info!(
        attempted = report.spots_attempted,
        completed = report.spots_completed,
        failed = report.spots_failed,
        records,
        "simulated run finished"
    );

    let exposition = metrics::export_text()?;
    info!(metrics_bytes = exposition.len(), "metrics exposition ready");

    Ok(())
}
