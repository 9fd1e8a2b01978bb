//! Step-based control environment over the potentiostat.
//!
//! ## Responsibility
//! Expose one spot's experiment as a bounded control loop with the familiar
//! reset/step/close contract: discrete actions nudge the applied potential,
//! a simulated clock advances by the settling delay each step, and the
//! final step of an episode yields a terminal reward derived from the
//! measured (or simulated) overpotential.
//!
//! ## Guarantees
//! - `step` is valid only while `Running`; misuse is reported, never
//!   papered over
//! - The wait between steps is fixed per episode (`step_potential /
//!   scan_rate`), not recomputed mid-episode
//! - Out-of-bounds readbacks are a data-quality warning, not a crash
//!
//! ## NOT Responsible For
//! - Choosing actions (that belongs to the caller's policy)
//! - Spot iteration and persistence (that belongs to `orchestrator`)

use crate::{
    actuator::{ActualValues, Actuator},
    metrics,
    overpotential::OverpotentialCalculator,
    positioner::Positioner,
    sweep::{SweepController, SweepParameters},
    ExperimentError, SweepRun, SweepTermination,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

/// Discrete action space of the control loop. Closed set of 3 — no other
/// values are valid.
///
/// The integer encoding (0 = hold, 1 = decrease, 2 = increase) matches the
/// convention agents are trained against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Keep the applied potential unchanged.
    Hold,
    /// Lower the applied potential by one step.
    Decrease,
    /// Raise the applied potential by one step.
    Increase,
}

impl Action {
    /// All actions, in encoding order.
    pub const ALL: [Action; 3] = [Action::Hold, Action::Decrease, Action::Increase];

    /// Decode an agent's integer action, if valid.
    pub fn from_index(index: u8) -> Option<Action> {
        match index {
            0 => Some(Action::Hold),
            1 => Some(Action::Decrease),
            2 => Some(Action::Increase),
            _ => None,
        }
    }

    /// The integer encoding of this action.
    pub fn index(&self) -> u8 {
        match self {
            Action::Hold => 0,
            Action::Decrease => 1,
            Action::Increase => 2,
        }
    }
}

/// Control-loop lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvPhase {
    /// Constructed, no episode started.
    Idle,
    /// An episode is in progress; `step` is valid.
    Running,
    /// The episode ended (step budget reached, cancellation, or fault).
    Terminated,
}

impl std::fmt::Display for EnvPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EnvPhase::Idle => "idle",
            EnvPhase::Running => "running",
            EnvPhase::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Instrument readback presented to the controlling agent.
///
/// Dimension order follows the documented bounds: applied potential,
/// cell current, measured potential.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Applied potential reported by the instrument (V).
    pub potential_applied: f64,
    /// Measured cell current (A).
    pub current: f64,
    /// Measured working-electrode potential (V).
    pub potential: f64,
}

impl Observation {
    /// The observation as a fixed-order 3-vector.
    pub fn as_array(&self) -> [f64; 3] {
        [self.potential_applied, self.current, self.potential]
    }
}

impl From<ActualValues> for Observation {
    fn from(actuals: ActualValues) -> Self {
        Self {
            potential_applied: actuals.potential_applied,
            current: actuals.current,
            potential: actuals.potential,
        }
    }
}

/// Documented per-dimension bounds of the observation vector.
///
/// Readings outside the bounds indicate a data-quality problem with the
/// cell or calibration; callers may [`clamp`](Self::clamp) before feeding
/// an agent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObservationSpace {
    /// Lower bound per dimension.
    pub low: [f64; 3],
    /// Upper bound per dimension.
    pub high: [f64; 3],
}

impl ObservationSpace {
    /// Whether every dimension of `obs` lies within the bounds.
    pub fn contains(&self, obs: &Observation) -> bool {
        obs.as_array()
            .iter()
            .zip(self.low.iter().zip(self.high.iter()))
            .all(|(v, (lo, hi))| *v >= *lo && *v <= *hi)
    }

    /// Clamp an observation into the bounds, dimension by dimension.
    pub fn clamp(&self, obs: &Observation) -> Observation {
        let a = obs.as_array();
        let clamped: Vec<f64> = a
            .iter()
            .zip(self.low.iter().zip(self.high.iter()))
            .map(|(v, (lo, hi))| v.max(*lo).min(*hi))
            .collect();
        Observation {
            potential_applied: clamped[0],
            current: clamped[1],
            potential: clamped[2],
        }
    }
}

impl Default for ObservationSpace {
    fn default() -> Self {
        Self {
            low: [0.0, -0.03, -0.1],
            high: [0.65, f64::INFINITY, 0.7],
        }
    }
}

/// Parameters of one control-loop episode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnvParameters {
    /// Potential applied at the beginning of an episode (V).
    pub start_potential: f64,
    /// Rate at which the agent may change the potential (V/s).
    pub scan_rate: f64,
    /// Potential change per Increase/Decrease action (V).
    pub step_potential: f64,
    /// Step budget of one episode.
    pub max_episode_length: u32,
    /// Probe travel between experiment spots (source units).
    pub distance_between_spots: f64,
}

impl EnvParameters {
    /// Settling delay between steps, fixed for the whole episode.
    pub fn wait_time(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.step_potential.abs() / self.scan_rate)
    }
}

impl Default for EnvParameters {
    fn default() -> Self {
        Self {
            start_potential: 0.0,
            scan_rate: 0.005,
            step_potential: 0.00244,
            max_episode_length: 1500,
            distance_between_spots: 2500.0,
        }
    }
}

// ── Reward strategies ─────────────────────────────────────────────────────

/// Terminal reward plus whatever the strategy measured to produce it.
#[derive(Debug, Clone)]
pub struct RewardOutcome {
    /// Scalar terminal reward.
    pub reward: f64,
    /// Overpotential observed by a measuring strategy (V).
    pub overpotential: Option<f64>,
    /// Sweep data collected by a measuring strategy.
    pub sweep: Option<SweepRun>,
}

/// Pluggable terminal-reward computation.
///
/// The environment lends the strategy its exclusively-owned actuator for
/// the duration of the call, so measuring strategies can run a full sweep
/// without a second instrument handle existing anywhere.
#[async_trait]
pub trait RewardStrategy: Send + Sync {
    /// Compute the terminal reward at the end of an episode.
    ///
    /// # Errors
    ///
    /// Propagates measurement and fit failures; the episode still
    /// terminates.
    async fn terminal_reward(
        &self,
        actuator: &mut dyn Actuator,
    ) -> Result<RewardOutcome, ExperimentError>;
}

/// Fixed terminal reward for simulation/test mode, when no physical
/// overpotential procedure is attached.
#[derive(Debug, Clone, Copy)]
pub struct ConstantReward {
    reward: f64,
}

impl ConstantReward {
    /// Strategy returning the given reward unconditionally.
    pub fn new(reward: f64) -> Self {
        Self { reward }
    }
}

impl Default for ConstantReward {
    fn default() -> Self {
        Self::new(1.0)
    }
}

#[async_trait]
impl RewardStrategy for ConstantReward {
    async fn terminal_reward(
        &self,
        _actuator: &mut dyn Actuator,
    ) -> Result<RewardOutcome, ExperimentError> {
        Ok(RewardOutcome {
            reward: self.reward,
            overpotential: None,
            sweep: None,
        })
    }
}

/// Terminal reward from a measured overpotential.
///
/// Runs a full overpotential-measurement sweep on the borrowed actuator,
/// extracts the overpotential, and rewards
/// `(target − observed) / target` — signed so a smaller observed
/// overpotential is better, normalized to the target.
pub struct MeasuredOverpotentialReward {
    target_overpotential: f64,
    sweep: SweepParameters,
    calculator: OverpotentialCalculator,
}

impl MeasuredOverpotentialReward {
    /// Strategy measuring against the given target with the given sweep.
    ///
    /// # Errors
    ///
    /// [`ExperimentError::Config`] if the target overpotential is zero or
    /// non-finite (the normalization would be meaningless), or if the sweep
    /// parameters fail validation.
    pub fn new(
        target_overpotential: f64,
        sweep: SweepParameters,
    ) -> Result<Self, ExperimentError> {
        if target_overpotential == 0.0 || !target_overpotential.is_finite() {
            return Err(ExperimentError::Config(format!(
                "target overpotential must be finite and nonzero, got {target_overpotential}"
            )));
        }
        sweep.validate()?;
        Ok(Self {
            target_overpotential,
            sweep,
            calculator: OverpotentialCalculator::new(),
        })
    }

    /// Replace the default overpotential calculator.
    pub fn with_calculator(mut self, calculator: OverpotentialCalculator) -> Self {
        self.calculator = calculator;
        self
    }
}

#[async_trait]
impl RewardStrategy for MeasuredOverpotentialReward {
    async fn terminal_reward(
        &self,
        actuator: &mut dyn Actuator,
    ) -> Result<RewardOutcome, ExperimentError> {
        let controller = SweepController::new(self.sweep);
        let outcome = controller.run(actuator).await?;

        match &outcome.termination {
            SweepTermination::Completed => {}
            SweepTermination::ActuatorFault { message } => {
                return Err(ExperimentError::ActuatorCommunication(message.clone()));
            }
            SweepTermination::Cancelled { .. } => {
                return Err(ExperimentError::Other(
                    "overpotential measurement sweep was cancelled".to_string(),
                ));
            }
        }

        let observed = self.calculator.compute(&outcome.run)?;
        let reward = (self.target_overpotential - observed) / self.target_overpotential;

        info!(
            target: "secm::env",
            observed_overpotential = observed,
            target_overpotential = self.target_overpotential,
            reward,
            "terminal overpotential measured"
        );

        Ok(RewardOutcome {
            reward,
            overpotential: Some(observed),
            sweep: Some(outcome.run),
        })
    }
}

// ── Step outcome ──────────────────────────────────────────────────────────

/// Auxiliary per-step information, alongside observation/reward/done.
#[derive(Debug, Clone, Default)]
pub struct StepInfo {
    /// The step observed an external cancellation and terminated early.
    pub cancelled: bool,
    /// The readback fell outside the documented observation bounds.
    pub out_of_bounds: bool,
    /// Overpotential measured at episode end, if the strategy measured one.
    pub overpotential: Option<f64>,
    /// Sweep data from the terminal measurement, if any.
    pub measurement: Option<SweepRun>,
}

/// Result of one control-loop step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// Instrument readback after the action was applied.
    pub observation: Observation,
    /// Zero on every step except the terminal one.
    pub reward: f64,
    /// Whether the episode ended with this step.
    pub done: bool,
    /// Auxiliary information.
    pub info: StepInfo,
}

// ── Environment ───────────────────────────────────────────────────────────

/// Control environment owning one potentiostat and one probe positioner.
///
/// State machine: `Idle` → (`reset`) → `Running` → (`step` × budget) →
/// `Terminated` → (`reset`) → `Running` → … . `reset` is callable from any
/// phase (calling it while `Running` abandons the in-flight episode);
/// `step` outside `Running` is a programming error.
pub struct ControlEnvironment<A: Actuator, P: Positioner> {
    actuator: A,
    positioner: P,
    params: EnvParameters,
    space: ObservationSpace,
    reward: Box<dyn RewardStrategy>,
    cancel: Option<watch::Receiver<bool>>,
    phase: EnvPhase,
    applied_potential: f64,
    step_count: u32,
    closed: bool,
}

impl<A: Actuator, P: Positioner> ControlEnvironment<A, P> {
    /// Environment over the given exclusively-owned instruments.
    pub fn new(
        actuator: A,
        positioner: P,
        params: EnvParameters,
        reward: Box<dyn RewardStrategy>,
    ) -> Self {
        Self {
            actuator,
            positioner,
            applied_potential: params.start_potential,
            params,
            space: ObservationSpace::default(),
            reward,
            cancel: None,
            phase: EnvPhase::Idle,
            step_count: 0,
            closed: false,
        }
    }

    /// Attach an external cancellation signal, observed between steps.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Override the documented observation bounds.
    pub fn with_observation_space(mut self, space: ObservationSpace) -> Self {
        self.space = space;
        self
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> EnvPhase {
        self.phase
    }

    /// Steps executed in the current episode.
    pub fn step_count(&self) -> u32 {
        self.step_count
    }

    /// The potential the loop currently applies (V).
    pub fn applied_potential(&self) -> f64 {
        self.applied_potential
    }

    /// The episode parameters.
    pub fn params(&self) -> &EnvParameters {
        &self.params
    }

    /// The documented observation bounds.
    pub fn observation_space(&self) -> &ObservationSpace {
        &self.space
    }

    /// Tear the environment apart, returning the instrument handles.
    pub fn into_parts(self) -> (A, P) {
        (self.actuator, self.positioner)
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Begin a new episode from any phase.
    ///
    /// Re-applies the start potential, zeroes the step counter, and returns
    /// the instrument's readback as the initial observation.
    ///
    /// # Errors
    ///
    /// [`ExperimentError::ActuatorCommunication`] if the instrument cannot
    /// be commanded or read.
    pub async fn reset(&mut self) -> Result<Observation, ExperimentError> {
        info!(
            target: "secm::env",
            from = %self.phase,
            start_potential = self.params.start_potential,
            "episode reset"
        );

        self.applied_potential = self.params.start_potential;
        self.step_count = 0;
        self.actuator.set_output(self.applied_potential).await?;
        self.phase = EnvPhase::Running;

        let (observation, _in_bounds) = self.observe().await?;
        Ok(observation)
    }

    /// Advance the loop by one action.
    ///
    /// Applies the action to the setpoint, commands the instrument, waits
    /// the fixed per-episode settling delay, and reads back the
    /// observation. On the final step of the budget the terminal reward is
    /// computed by the configured strategy and the phase moves to
    /// `Terminated`.
    ///
    /// # Errors
    ///
    /// - [`ExperimentError::InvalidStateTransition`] outside `Running`.
    /// - [`ExperimentError::ActuatorCommunication`] on instrument faults;
    ///   the episode terminates.
    /// - Fit errors from a measuring reward strategy; the episode
    ///   terminates.
    pub async fn step(&mut self, action: Action) -> Result<StepOutcome, ExperimentError> {
        if self.phase != EnvPhase::Running {
            return Err(ExperimentError::InvalidStateTransition {
                operation: "step",
                phase: self.phase,
            });
        }

        if self.is_cancelled() {
            info!(target: "secm::env", step = self.step_count, "cancellation observed, terminating episode");
            self.phase = EnvPhase::Terminated;
            metrics::inc_episode("cancelled");
            let (observation, in_bounds) = self.observe().await?;
            return Ok(StepOutcome {
                observation,
                reward: 0.0,
                done: true,
                info: StepInfo {
                    cancelled: true,
                    out_of_bounds: !in_bounds,
                    ..StepInfo::default()
                },
            });
        }

        let step_started = tokio::time::Instant::now();

        match action {
            Action::Increase => self.applied_potential += self.params.step_potential,
            Action::Decrease => self.applied_potential -= self.params.step_potential,
            Action::Hold => {}
        }

        if let Err(e) = self.actuator.set_output(self.applied_potential).await {
            self.fail_episode(&e);
            return Err(e);
        }
        tokio::time::sleep(self.params.wait_time()).await;
        self.step_count += 1;
        metrics::inc_episode_step();

        let mut info = StepInfo::default();
        let (reward, done) = if self.step_count >= self.params.max_episode_length {
            let outcome = match self.reward.terminal_reward(&mut self.actuator).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.fail_episode(&e);
                    return Err(e);
                }
            };
            self.phase = EnvPhase::Terminated;
            metrics::inc_episode("completed");
            info.overpotential = outcome.overpotential;
            info.measurement = outcome.sweep;
            (outcome.reward, true)
        } else {
            (0.0, false)
        };

        let (observation, in_bounds) = match self.observe().await {
            Ok(pair) => pair,
            Err(e) => {
                self.fail_episode(&e);
                return Err(e);
            }
        };
        info.out_of_bounds = !in_bounds;

        metrics::record_step_latency("control", step_started.elapsed());

        Ok(StepOutcome {
            observation,
            reward,
            done,
            info,
        })
    }

    /// Move the probe to the next experiment spot.
    ///
    /// # Errors
    ///
    /// [`ExperimentError::ActuatorCommunication`] on positioner faults.
    pub async fn advance_spot(&mut self) -> Result<(), ExperimentError> {
        self.positioner
            .advance(self.params.distance_between_spots)
            .await
    }

    /// Start a fresh substrate on the positioner.
    ///
    /// # Errors
    ///
    /// [`ExperimentError::ActuatorCommunication`] on positioner faults.
    pub async fn begin_substrate(&mut self) -> Result<(), ExperimentError> {
        self.positioner.begin_new_sample().await
    }

    /// Release the instruments: park the probe at the wash position and
    /// disable the potentiostat output. Idempotent; safe from any phase.
    ///
    /// # Errors
    ///
    /// [`ExperimentError::ActuatorCommunication`] on instrument faults.
    pub async fn close(&mut self) -> Result<(), ExperimentError> {
        if self.closed {
            return Ok(());
        }
        info!(target: "secm::env", "closing environment, parking probe");
        self.positioner.park().await?;
        self.actuator.disable().await?;
        self.closed = true;
        Ok(())
    }

    fn fail_episode(&mut self, err: &ExperimentError) {
        warn!(
            target: "secm::env",
            step = self.step_count,
            error = %err,
            "episode aborted"
        );
        if matches!(err, ExperimentError::ActuatorCommunication(_)) {
            metrics::inc_actuator_fault();
        }
        // The episode may already be counted if the terminal reward
        // succeeded and only the closing readback failed.
        if self.phase == EnvPhase::Running {
            metrics::inc_episode("fault");
        }
        self.phase = EnvPhase::Terminated;
    }

    async fn observe(&mut self) -> Result<(Observation, bool), ExperimentError> {
        let actuals = self.actuator.read_actuals().await?;
        let observation = Observation::from(actuals);
        let in_bounds = self.space.contains(&observation);
        if !in_bounds {
            warn!(
                target: "secm::env",
                observation = ?observation.as_array(),
                "readback outside documented observation bounds"
            );
        }
        Ok((observation, in_bounds))
    }
}
