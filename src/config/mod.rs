//! Declarative experiment configuration.
//!
//! ## Responsibility
//! Parse and validate TOML experiment configuration files. Users describe a
//! whole run declaratively — sweep bounds, spot spacing, control-loop
//! budget, failure policy — and hand the file to the rig at startup.
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same
//!   `ExperimentConfig`
//! - Validated: all semantic constraints are checked before a config is
//!   accepted
//! - Type-safe: invalid field combinations are caught at parse time via
//!   serde
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Building episodes/orchestrators from config (that belongs to callers
//!   wiring their instrument handles)
//! - File naming and folder layout of recorded data (that belongs to the
//!   persistence collaborator)

pub mod loader;
pub mod validation;

use crate::{env::EnvParameters, orchestrator::FailurePolicy, sweep::SweepParameters};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ── Default value functions ──────────────────────────────────────────────

/// Default control-episode step budget.
fn default_max_episode_length() -> u32 {
    1500
}

/// Default target overpotential for the measured reward (V).
fn default_target_overpotential() -> f64 {
    0.35
}

/// Default batch id.
fn default_batch_id() -> u32 {
    1
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for one experiment run.
///
/// Deserialized from a TOML file and validated before use.
/// Every field has either a required value or a documented default.
///
/// # Example
///
/// ```toml
/// [experiment]
/// name = "oer-screen"
/// substrate_material = "NiFe"
///
/// [sweep]
/// start_potential = 0.0
/// end_potential = 0.0122
/// scan_rate = 0.005
/// step_potential = 0.00244
///
/// [positioning]
/// spot_increment = 2500.0
/// number_of_experiments = 10
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ExperimentConfig {
    /// Experiment identity and sample description.
    pub experiment: ExperimentSection,
    /// Linear-sweep parameters.
    pub sweep: SweepSection,
    /// Probe positioning across the substrate.
    pub positioning: PositioningSection,
    /// Control-loop settings; defaults suit simulation mode.
    #[serde(default)]
    pub control: ControlSection,
    /// Orchestration mode and failure policy.
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    /// Observability: log output format.
    #[serde(default)]
    pub observability: ObservabilitySection,
}

impl ExperimentConfig {
    /// The sweep parameters described by this config.
    pub fn sweep_parameters(&self) -> SweepParameters {
        SweepParameters {
            start_potential: self.sweep.start_potential,
            end_potential: self.sweep.end_potential,
            scan_rate: self.sweep.scan_rate,
            step_potential: self.sweep.step_potential,
        }
    }

    /// The control-environment parameters described by this config.
    pub fn env_parameters(&self) -> EnvParameters {
        EnvParameters {
            start_potential: self.sweep.start_potential,
            scan_rate: self.sweep.scan_rate,
            step_potential: self.sweep.step_potential,
            max_episode_length: self.control.max_episode_length,
            distance_between_spots: self.positioning.spot_increment,
        }
    }
}

// ── Sections ─────────────────────────────────────────────────────────────

/// Experiment identity and sample description.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ExperimentSection {
    /// Human-readable experiment name (e.g., "oer-screen").
    pub name: String,
    /// Substrate material under test.
    pub substrate_material: String,
    /// Batch this run belongs to.
    #[serde(default = "default_batch_id")]
    pub batch_id: u32,
    /// Optional fixed experiment id; generated by the caller if omitted.
    pub experiment_id: Option<String>,
}

/// Linear-sweep parameters, shared by sweep episodes and the control loop.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct SweepSection {
    /// Potential applied at the first step (V).
    pub start_potential: f64,
    /// Potential the sweep runs toward (V).
    pub end_potential: f64,
    /// Rate of potential change (V/s).
    pub scan_rate: f64,
    /// Potential increment per step (V).
    pub step_potential: f64,
}

/// Probe positioning across the substrate.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct PositioningSection {
    /// Probe travel between experiment spots (source units).
    pub spot_increment: f64,
    /// Number of spots to measure in one run.
    pub number_of_experiments: u32,
}

/// Terminal-reward selection for control episodes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RewardKind {
    /// Run a full overpotential-measurement sweep at episode end.
    Measured,
    /// Fixed reward of 1 — simulation/test mode, no physical procedure.
    Constant,
}

/// Control-loop settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ControlSection {
    /// Step budget of one control episode.
    #[serde(default = "default_max_episode_length")]
    pub max_episode_length: u32,
    /// Target overpotential the measured reward normalizes against (V).
    #[serde(default = "default_target_overpotential")]
    pub target_overpotential: f64,
    /// Which terminal-reward strategy to use.
    #[serde(default)]
    pub reward: RewardKind,
}

impl Default for RewardKind {
    fn default() -> Self {
        RewardKind::Constant
    }
}

impl Default for ControlSection {
    fn default() -> Self {
        Self {
            max_episode_length: default_max_episode_length(),
            target_overpotential: default_target_overpotential(),
            reward: RewardKind::default(),
        }
    }
}

/// Which episode kind the orchestrator runs per spot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModeKind {
    /// One plain linear sweep per spot.
    #[default]
    Sweep,
    /// One control-loop episode per spot.
    Control,
}

/// Orchestration mode and failure policy.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
pub struct OrchestratorSection {
    /// Episode kind per spot.
    #[serde(default)]
    pub mode: ModeKind,
    /// What to do when a spot fails.
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable, colorized log output.
    #[default]
    Pretty,
    /// Structured JSON log output for machine consumption.
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
pub struct ObservabilitySection {
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Export the JSON Schema for `ExperimentConfig`.
///
/// This enables IDE autocomplete when editing TOML config files.
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails (should not
/// happen with well-formed derive macros).
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(ExperimentConfig);
    serde_json::to_string_pretty(&schema)
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    /// A config that passes validation, for tests to mutate.
    pub(crate) fn valid_config() -> ExperimentConfig {
        ExperimentConfig {
            experiment: ExperimentSection {
                name: "oer-screen".to_string(),
                substrate_material: "NiFe".to_string(),
                batch_id: 1,
                experiment_id: None,
            },
            sweep: SweepSection {
                start_potential: 0.0,
                end_potential: 0.0122,
                scan_rate: 0.005,
                step_potential: 0.00244,
            },
            positioning: PositioningSection {
                spot_increment: 2500.0,
                number_of_experiments: 10,
            },
            control: ControlSection::default(),
            orchestrator: OrchestratorSection::default(),
            observability: ObservabilitySection::default(),
        }
    }
}
