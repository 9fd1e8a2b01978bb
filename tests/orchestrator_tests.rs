//! Integration tests for spot-to-spot orchestration: record flow, failure
//! policies, and probe parking.

use secm_orchestrator::env::ConstantReward;
use secm_orchestrator::orchestrator::{
    ConstantPolicy, ControlEpisode, ExperimentIdentity, SweepEpisode,
};
use secm_orchestrator::{
    Action, ControlEnvironment, EnvParameters, EpisodeKind, ExperimentError,
    ExperimentOrchestrator, FailurePolicy, MemorySink, SimulatedCell, SimulatedStage,
    SweepParameters, SweepTermination,
};
use tokio::sync::watch;

fn sweep_params() -> SweepParameters {
    SweepParameters {
        start_potential: 0.0,
        end_potential: 0.0122,
        scan_rate: 0.005,
        step_potential: 0.00244,
    }
}

fn identity() -> ExperimentIdentity {
    ExperimentIdentity {
        experiment_name: "oer-screen".to_string(),
        experiment_id: "run-1".to_string(),
        substrate_material: "NiFe".to_string(),
        batch_id: 3,
        model_name: None,
        model_id: None,
    }
}

fn sweep_orchestrator(
    cell: SimulatedCell,
) -> ExperimentOrchestrator<SweepEpisode<SimulatedCell, SimulatedStage>, MemorySink> {
    let episode = SweepEpisode::new(cell, SimulatedStage::new(), sweep_params(), 2500.0);
    ExperimentOrchestrator::new(episode, MemorySink::new(), identity())
}

#[tokio::test(start_paused = true)]
async fn test_sweep_run_records_every_spot_with_coordinates() {
    let mut orchestrator = sweep_orchestrator(SimulatedCell::new());

    let report = orchestrator.run(3).await.expect("run succeeds");
    assert_eq!(report.spots_attempted, 3);
    assert_eq!(report.spots_completed, 3);
    assert_eq!(report.spots_failed, 0);

    let (episode, sink) = orchestrator.into_parts();
    assert_eq!(sink.len(), 3);

    for (i, (record, meta)) in sink.records().iter().enumerate() {
        assert_eq!(record.kind, EpisodeKind::Sweep);
        assert_eq!(record.run.len(), 5);
        assert_eq!(record.steps, 5);
        assert!(record.termination.is_completed());
        assert_eq!(meta.experiment_name, "oer-screen");
        assert_eq!(meta.substrate_material, "NiFe");
        assert_eq!(meta.batch_id, 3);
        assert_eq!(meta.coordinates, vec![2500.0 * (i as f64 + 1.0)]);
    }

    let (_, stage) = episode.into_parts();
    assert!(stage.is_parked());
    assert_eq!(stage.samples_started(), 1);
    assert_eq!(stage.position(), 7500.0);
}

#[tokio::test(start_paused = true)]
async fn test_fail_fast_stops_at_first_faulting_spot() {
    // 5 reads serve spot 1; spot 2 faults after 2 more and the run ends.
    let mut orchestrator = sweep_orchestrator(SimulatedCell::new().failing_after_reads(7))
        .with_failure_policy(FailurePolicy::FailFast);

    let err = orchestrator.run(3).await;
    assert!(matches!(
        err,
        Err(ExperimentError::ActuatorCommunication(_))
    ));

    let (episode, sink) = orchestrator.into_parts();

    // The complete first spot and the partial second spot were persisted
    // before the policy stopped the run.
    assert_eq!(sink.len(), 2);
    assert!(sink.records()[0].0.termination.is_completed());
    assert_eq!(sink.records()[1].0.run.len(), 2);
    assert!(matches!(
        sink.records()[1].0.termination,
        SweepTermination::ActuatorFault { .. }
    ));

    // Fail-fast still parks the probe on the way out.
    let (_, stage) = episode.into_parts();
    assert!(stage.is_parked());
}

#[tokio::test(start_paused = true)]
async fn test_continue_on_error_reports_and_proceeds() {
    let mut orchestrator = sweep_orchestrator(SimulatedCell::new().failing_after_reads(7))
        .with_failure_policy(FailurePolicy::ContinueOnError);

    let report = orchestrator.run(3).await.expect("run completes");
    assert_eq!(report.spots_attempted, 3);
    assert_eq!(report.spots_completed, 1);
    assert_eq!(report.spots_failed, 2);

    let (_, sink) = orchestrator.into_parts();
    assert_eq!(sink.len(), 3);
    assert!(matches!(
        sink.records()[2].0.termination,
        SweepTermination::ActuatorFault { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_control_mode_records_episodes_with_rewards() {
    let env = ControlEnvironment::new(
        SimulatedCell::new(),
        SimulatedStage::new(),
        EnvParameters {
            max_episode_length: 3,
            ..EnvParameters::default()
        },
        Box::new(ConstantReward::default()),
    );
    let episode = ControlEpisode::new(env, Box::new(ConstantPolicy::new(Action::Increase)));

    let mut identity = identity();
    identity.model_name = Some("scripted-ramp".to_string());

    let mut orchestrator = ExperimentOrchestrator::new(episode, MemorySink::new(), identity);
    let report = orchestrator.run(2).await.expect("run succeeds");
    assert_eq!(report.spots_completed, 2);

    let (_, sink) = orchestrator.into_parts();
    assert_eq!(sink.len(), 2);
    for (record, meta) in sink.records() {
        assert_eq!(record.kind, EpisodeKind::Control);
        assert_eq!(record.steps, 3);
        assert_eq!(record.run.len(), 3);
        assert_eq!(record.reward, Some(1.0));
        assert!(record.termination.is_completed());
        assert_eq!(meta.model_name.as_deref(), Some("scripted-ramp"));
    }
}

#[tokio::test(start_paused = true)]
async fn test_control_episode_spot_spacing_comes_from_env() {
    let env = ControlEnvironment::new(
        SimulatedCell::new(),
        SimulatedStage::new(),
        EnvParameters {
            max_episode_length: 1,
            distance_between_spots: 1000.0,
            ..EnvParameters::default()
        },
        Box::new(ConstantReward::default()),
    );
    let episode = ControlEpisode::new(env, Box::new(ConstantPolicy::new(Action::Hold)));

    let mut orchestrator = ExperimentOrchestrator::new(episode, MemorySink::new(), identity());
    orchestrator.run(2).await.expect("run succeeds");

    let (_, sink) = orchestrator.into_parts();
    assert_eq!(sink.records()[0].1.coordinates, vec![1000.0]);
    assert_eq!(sink.records()[1].1.coordinates, vec![2000.0]);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_before_first_spot_runs_nothing() {
    let (tx, rx) = watch::channel(false);
    tx.send(true).expect("signal");

    let mut orchestrator = sweep_orchestrator(SimulatedCell::new()).with_cancellation(rx);
    let report = orchestrator.run(5).await.expect("run returns cleanly");

    assert_eq!(report.spots_attempted, 0);
    assert_eq!(report.spots_completed, 0);

    let (episode, sink) = orchestrator.into_parts();
    assert!(sink.is_empty());
    let (_, stage) = episode.into_parts();
    assert!(stage.is_parked());
}

#[tokio::test(start_paused = true)]
async fn test_control_episode_fault_is_subject_to_failure_policy() {
    // Each episode consumes three reads (reset + two steps). The cell dies
    // after 7 reads, so episode 3 resets on read 7 and faults on its first
    // step's readback.
    let env = ControlEnvironment::new(
        SimulatedCell::new().failing_after_reads(7),
        SimulatedStage::new(),
        EnvParameters {
            max_episode_length: 2,
            ..EnvParameters::default()
        },
        Box::new(ConstantReward::default()),
    );
    let episode = ControlEpisode::new(env, Box::new(ConstantPolicy::new(Action::Hold)));

    let mut orchestrator = ExperimentOrchestrator::new(episode, MemorySink::new(), identity())
        .with_failure_policy(FailurePolicy::ContinueOnError);

    let report = orchestrator.run(3).await.expect("run completes");
    assert_eq!(report.spots_attempted, 3);
    assert_eq!(report.spots_completed, 2);
    assert_eq!(report.spots_failed, 1);

    let (_, sink) = orchestrator.into_parts();
    assert_eq!(sink.len(), 3);
    assert!(matches!(
        sink.records()[2].0.termination,
        SweepTermination::ActuatorFault { .. }
    ));
}
