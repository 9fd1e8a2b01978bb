//! Spot-to-spot experiment orchestration.
//!
//! ## Responsibility
//! Repeat the measure/record cycle across sample spots: advance the probe,
//! run one episode (a plain sweep or a control-loop episode), hand the
//! outcome to the persistence collaborator, and apply the configured
//! failure policy when a spot goes wrong.
//!
//! ## Guarantees
//! - Explicit termination: exactly `n_spots` spots are attempted unless a
//!   fail-fast failure or external cancellation ends the run early
//! - Partial results are persisted before the failure policy is applied
//! - The probe is parked when the run ends, on every path
//!
//! ## NOT Responsible For
//! - Serializing records to a storage format (that belongs to the sink)
//! - Choosing actions inside a control episode (that belongs to the policy)

use crate::{
    actuator::Actuator,
    env::{Action, ControlEnvironment, Observation},
    metrics,
    positioner::Positioner,
    sweep::{termination_label, SweepController, SweepParameters},
    EpisodeKind, EpisodeRecord, ExperimentError, RecordMetadata, Sample, SweepRun,
    SweepTermination,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn, Instrument, Span};

// ── Collaborator seams ────────────────────────────────────────────────────

/// Chooses the next action of a control episode from the latest
/// observation. The learning agent behind it is out of scope; anything
/// that can map observations to actions can drive an episode.
pub trait ActionPolicy: Send {
    /// Decide the action for the upcoming step.
    fn decide(&mut self, observation: &Observation) -> Action;
}

/// Policy that always picks the same action — a scripted ramp
/// (`Increase`), a plateau (`Hold`), or a descent (`Decrease`).
#[derive(Debug, Clone, Copy)]
pub struct ConstantPolicy {
    action: Action,
}

impl ConstantPolicy {
    /// Policy always answering `action`.
    pub fn new(action: Action) -> Self {
        Self { action }
    }
}

impl ActionPolicy for ConstantPolicy {
    fn decide(&mut self, _observation: &Observation) -> Action {
        self.action
    }
}

/// Persistence collaborator: accepts one episode outcome plus its metadata
/// and writes it to durable storage. The core never serializes records
/// itself; the sink owns the format.
#[async_trait]
pub trait RecordSink: Send {
    /// Persist one episode record.
    ///
    /// # Errors
    ///
    /// Any storage failure; the orchestrator's failure policy decides
    /// whether the run continues.
    async fn record(
        &mut self,
        record: &EpisodeRecord,
        meta: &RecordMetadata,
    ) -> Result<(), ExperimentError>;
}

/// In-memory sink for tests and simulation mode.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Vec<(EpisodeRecord, RecordMetadata)>,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// All records received, in arrival order.
    pub fn records(&self) -> &[(EpisodeRecord, RecordMetadata)] {
        &self.records
    }

    /// Number of records received.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no record has been received.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn record(
        &mut self,
        record: &EpisodeRecord,
        meta: &RecordMetadata,
    ) -> Result<(), ExperimentError> {
        self.records.push((record.clone(), meta.clone()));
        Ok(())
    }
}

// ── Episodes ──────────────────────────────────────────────────────────────

/// One per-spot experiment, owning its instrument resources.
///
/// The orchestrator decides *when* to move and measure; the episode owns
/// *how*, including the exclusively-owned actuator/positioner handles.
#[async_trait]
pub trait Episode: Send {
    /// Which kind of record this episode produces.
    fn kind(&self) -> EpisodeKind;

    /// Probe travel between spots (source units).
    fn spot_increment(&self) -> f64;

    /// Start a fresh substrate.
    ///
    /// # Errors
    ///
    /// Positioner faults.
    async fn begin_substrate(&mut self) -> Result<(), ExperimentError>;

    /// Move the probe to the next spot.
    ///
    /// # Errors
    ///
    /// Positioner faults.
    async fn advance_spot(&mut self) -> Result<(), ExperimentError>;

    /// Execute one episode at the current spot.
    ///
    /// Instrument faults mid-episode are reported inside the returned
    /// record's termination, with the partial data preserved; `Err` is
    /// reserved for failures that leave no meaningful record (bad
    /// parameters, fit errors, state-machine misuse).
    async fn run_episode(&mut self) -> Result<EpisodeRecord, ExperimentError>;

    /// Release the instruments (park the probe, power down the output).
    ///
    /// # Errors
    ///
    /// Instrument faults.
    async fn finish(&mut self) -> Result<(), ExperimentError>;
}

/// Episode running one stepped linear sweep per spot.
pub struct SweepEpisode<A: Actuator, P: Positioner> {
    actuator: A,
    positioner: P,
    controller: SweepController,
    spot_increment: f64,
}

impl<A: Actuator, P: Positioner> SweepEpisode<A, P> {
    /// Sweep episode over the given instruments.
    pub fn new(actuator: A, positioner: P, params: SweepParameters, spot_increment: f64) -> Self {
        Self {
            actuator,
            positioner,
            controller: SweepController::new(params),
            spot_increment,
        }
    }

    /// Attach an external cancellation signal, observed between steps.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.controller = SweepController::new(*self.controller.params()).with_cancellation(cancel);
        self
    }

    /// Tear the episode apart, returning the instrument handles.
    pub fn into_parts(self) -> (A, P) {
        (self.actuator, self.positioner)
    }
}

#[async_trait]
impl<A: Actuator, P: Positioner> Episode for SweepEpisode<A, P> {
    fn kind(&self) -> EpisodeKind {
        EpisodeKind::Sweep
    }

    fn spot_increment(&self) -> f64 {
        self.spot_increment
    }

    async fn begin_substrate(&mut self) -> Result<(), ExperimentError> {
        self.positioner.begin_new_sample().await
    }

    async fn advance_spot(&mut self) -> Result<(), ExperimentError> {
        self.positioner.advance(self.spot_increment).await
    }

    async fn run_episode(&mut self) -> Result<EpisodeRecord, ExperimentError> {
        let outcome = self.controller.run(&mut self.actuator).await?;
        Ok(EpisodeRecord {
            kind: EpisodeKind::Sweep,
            steps: outcome.run.len() as u32,
            run: outcome.run,
            reward: None,
            overpotential: None,
            termination: outcome.termination,
        })
    }

    async fn finish(&mut self) -> Result<(), ExperimentError> {
        self.positioner.park().await?;
        self.actuator.disable().await
    }
}

/// Episode running one bounded control-loop episode per spot.
pub struct ControlEpisode<A: Actuator, P: Positioner> {
    env: ControlEnvironment<A, P>,
    policy: Box<dyn ActionPolicy>,
}

impl<A: Actuator, P: Positioner> ControlEpisode<A, P> {
    /// Control episode driving `env` with `policy`.
    pub fn new(env: ControlEnvironment<A, P>, policy: Box<dyn ActionPolicy>) -> Self {
        Self { env, policy }
    }

    /// The wrapped environment.
    pub fn env(&self) -> &ControlEnvironment<A, P> {
        &self.env
    }

    /// Tear the episode apart, returning the environment.
    pub fn into_env(self) -> ControlEnvironment<A, P> {
        self.env
    }
}

#[async_trait]
impl<A: Actuator, P: Positioner> Episode for ControlEpisode<A, P> {
    fn kind(&self) -> EpisodeKind {
        EpisodeKind::Control
    }

    fn spot_increment(&self) -> f64 {
        self.env.params().distance_between_spots
    }

    async fn begin_substrate(&mut self) -> Result<(), ExperimentError> {
        self.env.begin_substrate().await
    }

    async fn advance_spot(&mut self) -> Result<(), ExperimentError> {
        self.env.advance_spot().await
    }

    async fn run_episode(&mut self) -> Result<EpisodeRecord, ExperimentError> {
        let started = tokio::time::Instant::now();
        let mut run = SweepRun::new();
        let mut observation = self.env.reset().await?;

        loop {
            let action = self.policy.decide(&observation);
            let outcome = match self.env.step(action).await {
                Ok(outcome) => outcome,
                Err(ExperimentError::ActuatorCommunication(message)) => {
                    // The partial episode is still a record; the failure
                    // policy sees the fault through the termination.
                    return Ok(EpisodeRecord {
                        kind: EpisodeKind::Control,
                        steps: self.env.step_count(),
                        run,
                        reward: None,
                        overpotential: None,
                        termination: SweepTermination::ActuatorFault { message },
                    });
                }
                Err(e) => return Err(e),
            };

            observation = outcome.observation;

            if outcome.info.cancelled {
                return Ok(EpisodeRecord {
                    kind: EpisodeKind::Control,
                    steps: self.env.step_count(),
                    run,
                    reward: None,
                    overpotential: None,
                    termination: SweepTermination::Cancelled {
                        after_steps: self.env.step_count() as usize,
                    },
                });
            }

            run.push(Sample {
                elapsed_s: started.elapsed().as_secs_f64(),
                potential: observation.potential,
                current: observation.current,
                potential_applied: observation.potential_applied,
                scan: 1,
            });
            metrics::add_samples(1);

            if outcome.done {
                return Ok(EpisodeRecord {
                    kind: EpisodeKind::Control,
                    steps: self.env.step_count(),
                    run,
                    reward: Some(outcome.reward),
                    overpotential: outcome.info.overpotential,
                    termination: SweepTermination::Completed,
                });
            }
        }
    }

    async fn finish(&mut self) -> Result<(), ExperimentError> {
        self.env.close().await
    }
}

// ── Orchestrator ──────────────────────────────────────────────────────────

/// What to do when a spot's episode fails.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, schemars::JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Park the probe and end the run at the first failing spot.
    #[default]
    FailFast,
    /// Report the failure and proceed to the next spot.
    ContinueOnError,
}

/// Identity stamped onto every record's metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentIdentity {
    /// Human-readable experiment name.
    pub experiment_name: String,
    /// Unique identifier of this experiment run.
    pub experiment_id: String,
    /// Substrate material under test.
    pub substrate_material: String,
    /// Batch this run belongs to.
    pub batch_id: u32,
    /// Name of the controlling model, for control experiments.
    pub model_name: Option<String>,
    /// Identifier of the controlling model, for control experiments.
    pub model_id: Option<String>,
}

/// Tally of one orchestrator run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// Spots the run attempted (advanced to).
    pub spots_attempted: u32,
    /// Spots whose episode completed and was recorded.
    pub spots_completed: u32,
    /// Spots that failed (fault, fit error, or storage error).
    pub spots_failed: u32,
}

enum SpotStatus {
    Recorded,
    CancelledMidEpisode,
    Faulted(String),
}

/// Repeats sweep/control episodes across sample spots.
pub struct ExperimentOrchestrator<E: Episode, S: RecordSink> {
    episode: E,
    sink: S,
    identity: ExperimentIdentity,
    failure_policy: FailurePolicy,
    cancel: Option<watch::Receiver<bool>>,
}

impl<E: Episode, S: RecordSink> ExperimentOrchestrator<E, S> {
    /// Orchestrator over the given episode runner and sink.
    pub fn new(episode: E, sink: S, identity: ExperimentIdentity) -> Self {
        Self {
            episode,
            sink,
            identity,
            failure_policy: FailurePolicy::default(),
            cancel: None,
        }
    }

    /// Select the failure policy (default: fail fast).
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Attach an external cancellation signal, observed between spots.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Tear the orchestrator apart, returning the episode and sink.
    pub fn into_parts(self) -> (E, S) {
        (self.episode, self.sink)
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    fn metadata(&self, position: f64) -> RecordMetadata {
        RecordMetadata {
            experiment_name: self.identity.experiment_name.clone(),
            experiment_id: self.identity.experiment_id.clone(),
            substrate_material: self.identity.substrate_material.clone(),
            batch_id: self.identity.batch_id,
            model_name: self.identity.model_name.clone(),
            model_id: self.identity.model_id.clone(),
            coordinates: vec![position],
            timestamp: Utc::now(),
        }
    }

    /// Run episodes at `n_spots` consecutive spots.
    ///
    /// Ends after exactly `n_spots` spots, at the first failure under
    /// [`FailurePolicy::FailFast`], or early on external cancellation.
    /// The probe is parked before returning, on every path.
    ///
    /// # Errors
    ///
    /// Under `FailFast`, the error that stopped the run. Storage and
    /// positioning faults are subject to the same policy as episode
    /// failures.
    pub async fn run(&mut self, n_spots: u32) -> Result<RunReport, ExperimentError> {
        info!(
            target: "secm::orchestrator",
            spots = n_spots,
            kind = ?self.episode.kind(),
            policy = ?self.failure_policy,
            "experiment run starting"
        );

        self.episode.begin_substrate().await?;

        let mut report = RunReport::default();
        let mut position = 0.0;

        for spot in 0..n_spots {
            if self.is_cancelled() {
                info!(target: "secm::orchestrator", spot, "cancellation observed, ending run");
                break;
            }
            report.spots_attempted += 1;

            match self.run_spot(spot, &mut position).await {
                Ok(SpotStatus::Recorded) => {
                    report.spots_completed += 1;
                    metrics::inc_spot("ok");
                }
                Ok(SpotStatus::CancelledMidEpisode) => {
                    metrics::inc_spot("cancelled");
                    info!(
                        target: "secm::orchestrator",
                        spot,
                        "episode cancelled, partial record persisted, ending run"
                    );
                    break;
                }
                Ok(SpotStatus::Faulted(message)) => {
                    report.spots_failed += 1;
                    metrics::inc_spot("err");
                    warn!(target: "secm::orchestrator", spot, error = %message, "spot faulted");
                    if self.failure_policy == FailurePolicy::FailFast {
                        let _ = self.episode.finish().await;
                        return Err(ExperimentError::ActuatorCommunication(message));
                    }
                }
                Err(e) => {
                    report.spots_failed += 1;
                    metrics::inc_spot("err");
                    warn!(target: "secm::orchestrator", spot, error = %e, "spot failed");
                    if self.failure_policy == FailurePolicy::FailFast {
                        let _ = self.episode.finish().await;
                        return Err(e);
                    }
                }
            }
        }

        self.episode.finish().await?;

        info!(
            target: "secm::orchestrator",
            attempted = report.spots_attempted,
            completed = report.spots_completed,
            failed = report.spots_failed,
            "experiment run finished"
        );
        Ok(report)
    }

    async fn run_spot(
        &mut self,
        spot: u32,
        position: &mut f64,
    ) -> Result<SpotStatus, ExperimentError> {
        let span = tracing::info_span!(
            "orchestrator.spot",
            spot,
            outcome = tracing::field::Empty,
        );

        async move {
            self.episode.advance_spot().await?;
            *position += self.episode.spot_increment();

            let record = self.episode.run_episode().await?;
            let meta = self.metadata(*position);
            self.sink.record(&record, &meta).await?;

            let label = termination_label(&record.termination);
            Span::current().record("outcome", label);

            Ok(match record.termination {
                SweepTermination::Completed => SpotStatus::Recorded,
                SweepTermination::Cancelled { .. } => SpotStatus::CancelledMidEpisode,
                SweepTermination::ActuatorFault { message } => SpotStatus::Faulted(message),
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_policy_ignores_observation() {
        let mut policy = ConstantPolicy::new(Action::Increase);
        let obs = Observation {
            potential_applied: 0.1,
            current: 0.0,
            potential: 0.1,
        };
        assert_eq!(policy.decide(&obs), Action::Increase);
        assert_eq!(policy.decide(&obs), Action::Increase);
    }

    #[test]
    fn test_failure_policy_defaults_to_fail_fast() {
        assert_eq!(FailurePolicy::default(), FailurePolicy::FailFast);
    }

    #[tokio::test]
    async fn test_memory_sink_stores_records_in_order() {
        let mut sink = MemorySink::new();
        assert!(sink.is_empty());

        let record = EpisodeRecord {
            kind: EpisodeKind::Sweep,
            run: SweepRun::new(),
            steps: 0,
            reward: None,
            overpotential: None,
            termination: SweepTermination::Completed,
        };
        let meta = RecordMetadata {
            experiment_name: "oer".to_string(),
            experiment_id: "exp-1".to_string(),
            substrate_material: "NiFe".to_string(),
            batch_id: 1,
            model_name: None,
            model_id: None,
            coordinates: vec![2500.0],
            timestamp: Utc::now(),
        };
        sink.record(&record, &meta).await.expect("record");
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.records()[0].1.coordinates, vec![2500.0]);
    }
}
