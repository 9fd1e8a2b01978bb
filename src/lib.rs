//! # secm-orchestrator
//!
//! Automation core for scanning electrochemical microscopy (SECM)
//! experiments: a potentiostat applies stepped potential sweeps at one spot
//! of a sample surface, a probe positioner moves between spots, and an
//! orchestrator repeats the measure/record cycle across the substrate.
//!
//! ## Architecture
//!
//! ```text
//! ExperimentOrchestrator
//!     ├─ Positioner ──── advance / park between spots
//!     ├─ Episode ─────── one sweep or one control-loop episode per spot
//!     │     ├─ SweepController ── stepped linear sweep against an Actuator
//!     │     └─ ControlEnvironment ── action-driven loop, terminal reward
//!     │            └─ RewardStrategy ── measured overpotential or constant
//!     └─ RecordSink ──── persistence collaborator (out-of-core format)
//! ```
//!
//! The actuator and positioner are exclusively-owned collaborator handles;
//! all instrument commands are serialized through their single owner. Every
//! step of a sweep or episode is followed by a settling delay derived from
//! the configured scan rate.

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod actuator;
pub mod config;
pub mod env;
pub mod metrics;
pub mod orchestrator;
pub mod overpotential;
pub mod positioner;
pub mod sweep;

// Re-exports for convenience
pub use actuator::{ActualValues, Actuator, SimulatedCell};
pub use env::{
    Action, ControlEnvironment, EnvParameters, EnvPhase, Observation, ObservationSpace,
    RewardStrategy,
};
pub use orchestrator::{ExperimentOrchestrator, FailurePolicy, MemorySink, RecordSink, RunReport};
pub use overpotential::{current_density, OverpotentialCalculator};
pub use positioner::{Positioner, SimulatedStage};
pub use sweep::{SweepController, SweepParameters};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"` — structured JSON output for production log aggregators
/// - anything else (including unset) — human-readable pretty output
///   for bench-side development
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`ExperimentError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
pub fn init_tracing() -> Result<(), ExperimentError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| ExperimentError::Other(format!("tracing init failed: {e}")))
}

/// Top-level experiment errors.
///
/// Every failure surface of the core is mapped to a variant here.
/// All variants implement `std::error::Error` via [`thiserror`].
#[derive(Error, Debug)]
pub enum ExperimentError {
    /// The overpotential fit is under-determined: fewer than two samples
    /// survived the current-density window and index filters.
    #[error("insufficient data for linear fit: {points} point(s) after filtering, need at least 2")]
    InsufficientData {
        /// Number of samples remaining after filtering.
        points: usize,
    },

    /// The fitted current-density line has zero slope, so the potential at
    /// the target density cannot be evaluated. Reported explicitly rather
    /// than silently producing an infinite or NaN overpotential.
    #[error("degenerate linear fit: slope is zero, cannot solve for the target current density")]
    DivisionByZero,

    /// Malformed sweep bounds: a sweep with these parameters would run in
    /// the wrong direction or never terminate.
    #[error(
        "invalid sweep parameters ({reason}): start {start} V, end {end} V, \
         step {step_potential} V, scan rate {scan_rate} V/s"
    )]
    InvalidSweepRange {
        /// Which precondition was violated.
        reason: &'static str,
        /// Requested start potential (V).
        start: f64,
        /// Requested end potential (V).
        end: f64,
        /// Requested potential step (V).
        step_potential: f64,
        /// Requested scan rate (V/s).
        scan_rate: f64,
    },

    /// An I/O fault occurred while talking to the physical instrument.
    /// Aborts the current sweep/episode; already-collected samples are
    /// preserved and returned to the caller.
    #[error("actuator communication failed: {0}")]
    ActuatorCommunication(String),

    /// Control-loop misuse: an operation was called in a phase that does
    /// not permit it. This is a programming error, always reported, never
    /// recovered internally.
    #[error("invalid state transition: {operation} called while {phase}")]
    InvalidStateTransition {
        /// The operation that was attempted.
        operation: &'static str,
        /// The phase the environment was in at the time.
        phase: env::EnvPhase,
    },

    /// A configuration value is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

// ── Measurement data model ────────────────────────────────────────────────

/// One synchronized measurement tuple recorded during a sweep or episode.
///
/// Immutable once recorded; producers append samples in strictly increasing
/// `elapsed_s` order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Seconds since the start of the sweep/episode. Always `>= 0`.
    pub elapsed_s: f64,
    /// Measured potential read back from the instrument (V).
    pub potential: f64,
    /// Measured current read back from the instrument (A).
    pub current: f64,
    /// Applied potential as reported by the instrument (V).
    pub potential_applied: f64,
    /// Forward-scan segment index. The sweep controller always emits `1`;
    /// CV-staircase data may carry later segments.
    pub scan: u32,
}

/// Ordered sequence of [`Sample`]s produced by one sweep or episode.
///
/// Invariant: samples are strictly increasing in `elapsed_s`. The producing
/// controller maintains this by construction; [`SweepRun::from_samples`]
/// validates it for externally built runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepRun {
    samples: Vec<Sample>,
}

impl SweepRun {
    /// Create an empty run.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a run from pre-collected samples, validating time ordering.
    ///
    /// # Errors
    ///
    /// Returns [`ExperimentError::Other`] if the samples are not strictly
    /// increasing in `elapsed_s`.
    pub fn from_samples(samples: Vec<Sample>) -> Result<Self, ExperimentError> {
        if samples.windows(2).any(|w| w[1].elapsed_s <= w[0].elapsed_s) {
            return Err(ExperimentError::Other(
                "samples are not in strictly increasing elapsed-time order".to_string(),
            ));
        }
        Ok(Self { samples })
    }

    /// Append a sample. Callers must append in strictly increasing
    /// `elapsed_s` order; violated only by a producer bug.
    pub fn push(&mut self, sample: Sample) {
        debug_assert!(
            self.samples
                .last()
                .map(|prev| sample.elapsed_s > prev.elapsed_s)
                .unwrap_or(true),
            "sample appended out of time order"
        );
        self.samples.push(sample);
    }

    /// All samples in recording order.
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Number of recorded samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the run holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// The most recently recorded sample, if any.
    pub fn last(&self) -> Option<&Sample> {
        self.samples.last()
    }
}

/// How a sweep or episode ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SweepTermination {
    /// All planned steps executed.
    Completed,
    /// An external cancellation signal was observed between steps.
    Cancelled {
        /// Steps executed before cancellation.
        after_steps: usize,
    },
    /// The actuator faulted mid-run; remaining steps were abandoned.
    ActuatorFault {
        /// Human-readable fault description.
        message: String,
    },
}

impl SweepTermination {
    /// Whether the run executed every planned step.
    pub fn is_completed(&self) -> bool {
        matches!(self, SweepTermination::Completed)
    }
}

/// Result of one sweep: the collected samples plus how the run ended.
///
/// Partial data survives faults and cancellation — the caller decides
/// whether to persist or retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepOutcome {
    /// Samples collected before termination.
    pub run: SweepRun,
    /// Why the sweep stopped.
    pub termination: SweepTermination,
}

// ── Episode records ───────────────────────────────────────────────────────

/// Which kind of per-spot episode produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeKind {
    /// A plain stepped linear sweep.
    Sweep,
    /// An action-driven control-loop episode.
    Control,
}

/// Outcome of one per-spot episode, handed to the persistence collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeRecord {
    /// Kind of episode that produced this record.
    pub kind: EpisodeKind,
    /// Samples collected during the episode (per-step observations for
    /// control episodes, the sweep itself for sweep episodes).
    pub run: SweepRun,
    /// Steps executed.
    pub steps: u32,
    /// Terminal reward, for control episodes.
    pub reward: Option<f64>,
    /// Overpotential extracted by the measured reward strategy, if any (V).
    pub overpotential: Option<f64>,
    /// How the episode ended.
    pub termination: SweepTermination,
}

/// Metadata accompanying every persisted [`EpisodeRecord`].
///
/// The core never serializes records itself; the sink owns the format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordMetadata {
    /// Human-readable experiment name.
    pub experiment_name: String,
    /// Unique identifier of this experiment run.
    pub experiment_id: String,
    /// Substrate material under test.
    pub substrate_material: String,
    /// Batch this spot belongs to.
    pub batch_id: u32,
    /// Name of the controlling model, for control episodes.
    pub model_name: Option<String>,
    /// Identifier of the controlling model, for control episodes.
    pub model_id: Option<String>,
    /// Probe coordinates on the substrate (source units).
    pub coordinates: Vec<f64>,
    /// Wall-clock time the record was produced.
    pub timestamp: DateTime<Utc>,
}
