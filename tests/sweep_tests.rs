//! Integration tests for the sweep controller against the simulated cell.
//!
//! All tests run on tokio's paused clock — a real sweep spends hundreds of
//! milliseconds per step honoring the scan rate, which the paused clock
//! fast-forwards deterministically.

use secm_orchestrator::{
    ExperimentError, SimulatedCell, SweepController, SweepParameters, SweepTermination,
};
use tokio::sync::watch;

fn reference_params() -> SweepParameters {
    SweepParameters {
        start_potential: 0.0,
        end_potential: 0.0122,
        scan_rate: 0.005,
        step_potential: 0.00244,
    }
}

#[tokio::test(start_paused = true)]
async fn test_sweep_produces_exactly_step_count_samples() {
    let params = SweepParameters {
        start_potential: 0.0,
        end_potential: 0.5,
        scan_rate: 0.005,
        step_potential: 0.01,
    };
    let mut cell = SimulatedCell::new();

    let outcome = SweepController::new(params)
        .run(&mut cell)
        .await
        .expect("sweep runs");

    assert_eq!(outcome.run.len(), params.step_count());
    assert_eq!(outcome.run.len(), 50);
    assert!(outcome.termination.is_completed());
}

#[tokio::test(start_paused = true)]
async fn test_sweep_elapsed_times_strictly_increase_by_step_interval() {
    let params = reference_params();
    let mut cell = SimulatedCell::new();

    let outcome = SweepController::new(params)
        .run(&mut cell)
        .await
        .expect("sweep runs");

    let interval = params.step_interval().as_secs_f64();
    let samples = outcome.run.samples();
    for pair in samples.windows(2) {
        assert!(pair[1].elapsed_s > pair[0].elapsed_s);
    }
    for (i, sample) in samples.iter().enumerate() {
        assert!((sample.elapsed_s - i as f64 * interval).abs() < 1e-6);
    }
}

#[tokio::test(start_paused = true)]
async fn test_reference_sweep_ends_within_one_step_of_end_potential() {
    // start 0.0 → end 0.0122 at 0.00244/step: 5 steps, last commanded
    // potential one step short of the end bound.
    let params = reference_params();
    let mut cell = SimulatedCell::new();

    let outcome = SweepController::new(params)
        .run(&mut cell)
        .await
        .expect("sweep runs");

    assert_eq!(outcome.run.len(), 5);

    let last_applied = outcome
        .run
        .last()
        .map(|s| s.potential_applied)
        .expect("samples present");
    assert!((last_applied - params.end_potential).abs() <= params.step_potential + 1e-12);

    // The instrument is left at the last commanded potential.
    assert!((cell.applied() - 0.00976).abs() < 1e-12);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_parameters_are_rejected_before_any_command() {
    let params = SweepParameters {
        start_potential: 0.0,
        end_potential: 0.5,
        scan_rate: 0.005,
        step_potential: -0.01,
    };
    let mut cell = SimulatedCell::new();

    let err = SweepController::new(params).run(&mut cell).await;
    assert!(matches!(
        err,
        Err(ExperimentError::InvalidSweepRange { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_actuator_fault_preserves_partial_run() {
    let params = reference_params();
    let mut cell = SimulatedCell::new().failing_after_reads(3);

    let outcome = SweepController::new(params)
        .run(&mut cell)
        .await
        .expect("fault is not a hard error");

    assert_eq!(outcome.run.len(), 3);
    assert!(matches!(
        outcome.termination,
        SweepTermination::ActuatorFault { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_pre_set_cancellation_yields_empty_run() {
    let params = reference_params();
    let (tx, rx) = watch::channel(false);
    tx.send(true).expect("signal");

    let mut cell = SimulatedCell::new();
    let outcome = SweepController::new(params)
        .with_cancellation(rx)
        .run(&mut cell)
        .await
        .expect("cancellation is not a hard error");

    assert!(outcome.run.is_empty());
    assert_eq!(
        outcome.termination,
        SweepTermination::Cancelled { after_steps: 0 }
    );
}

#[tokio::test(start_paused = true)]
async fn test_mid_sweep_cancellation_preserves_collected_samples() {
    // Step interval is 0.488 s; cancel shortly after the second step has
    // been recorded.
    let params = reference_params();
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_secs_f64(0.75)).await;
        let _ = tx.send(true);
    });

    let mut cell = SimulatedCell::new();
    let outcome = SweepController::new(params)
        .with_cancellation(rx)
        .run(&mut cell)
        .await
        .expect("cancellation is not a hard error");

    assert!(matches!(
        outcome.termination,
        SweepTermination::Cancelled { .. }
    ));
    assert!(!outcome.run.is_empty());
    assert!(outcome.run.len() < params.step_count());
}

#[tokio::test(start_paused = true)]
async fn test_sweep_samples_carry_simulated_cell_response() {
    let params = reference_params();
    let mut cell = SimulatedCell::new().with_response(2.0, 0.001);

    let outcome = SweepController::new(params)
        .run(&mut cell)
        .await
        .expect("sweep runs");

    let area = secm_orchestrator::overpotential::probe_area(
        secm_orchestrator::overpotential::PROBE_DIAMETER,
    );
    for (i, sample) in outcome.run.samples().iter().enumerate() {
        let applied = i as f64 * params.step_potential;
        assert!((sample.potential_applied - applied).abs() < 1e-12);
        let expected_current = (2.0 * applied + 0.001) * area;
        assert!((sample.current - expected_current).abs() < 1e-15);
        assert_eq!(sample.scan, 1);
    }
}
