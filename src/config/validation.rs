//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`ExperimentConfig`] that
//! cannot be expressed through the type system alone (range checks,
//! cross-field invariants like sweep direction).
//!
//! ## Guarantees
//! - Every validation rule has at least one test that triggers it
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - File I/O (that belongs to `loader`)

use super::{ExperimentConfig, RewardKind};

/// Errors arising from configuration parsing, validation, or I/O.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "sweep.scan_rate").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Validate all semantic constraints on a parsed config.
///
/// Collects every violation instead of stopping at the first, so a user
/// can fix a config file in one pass.
///
/// # Errors
///
/// A non-empty list of [`ConfigError::InvalidField`] describing each
/// violated rule.
pub fn validate(config: &ExperimentConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    let invalid = |field: &str, value: String, reason: &str| ConfigError::InvalidField {
        field: field.to_string(),
        value,
        reason: reason.to_string(),
    };

    // Sweep preconditions mirror the controller's runtime checks so a bad
    // file is rejected before any instrument is touched.
    let sweep = &config.sweep;
    if !sweep.start_potential.is_finite()
        || !sweep.end_potential.is_finite()
        || !sweep.scan_rate.is_finite()
        || !sweep.step_potential.is_finite()
    {
        errors.push(invalid(
            "sweep",
            format!(
                "start={}, end={}, scan_rate={}, step={}",
                sweep.start_potential, sweep.end_potential, sweep.scan_rate, sweep.step_potential
            ),
            "all sweep parameters must be finite",
        ));
    } else {
        if sweep.scan_rate <= 0.0 {
            errors.push(invalid(
                "sweep.scan_rate",
                sweep.scan_rate.to_string(),
                "scan rate must be positive",
            ));
        }
        if sweep.step_potential == 0.0 {
            errors.push(invalid(
                "sweep.step_potential",
                sweep.step_potential.to_string(),
                "step potential must be nonzero",
            ));
        } else if (sweep.end_potential - sweep.start_potential) * sweep.step_potential <= 0.0 {
            errors.push(invalid(
                "sweep.step_potential",
                sweep.step_potential.to_string(),
                "step potential must drive the sweep toward the end potential",
            ));
        }
    }

    let positioning = &config.positioning;
    if !(positioning.spot_increment.is_finite() && positioning.spot_increment > 0.0) {
        errors.push(invalid(
            "positioning.spot_increment",
            positioning.spot_increment.to_string(),
            "spot increment must be positive and finite",
        ));
    }
    if positioning.number_of_experiments == 0 {
        errors.push(invalid(
            "positioning.number_of_experiments",
            positioning.number_of_experiments.to_string(),
            "at least one experiment is required",
        ));
    }

    let control = &config.control;
    if control.max_episode_length == 0 {
        errors.push(invalid(
            "control.max_episode_length",
            control.max_episode_length.to_string(),
            "an episode needs at least one step",
        ));
    }
    if control.reward == RewardKind::Measured
        && (control.target_overpotential == 0.0 || !control.target_overpotential.is_finite())
    {
        errors.push(invalid(
            "control.target_overpotential",
            control.target_overpotential.to_string(),
            "the measured reward normalizes by the target, which must be finite and nonzero",
        ));
    }

    if config.experiment.name.trim().is_empty() {
        errors.push(invalid(
            "experiment.name",
            format!("{:?}", config.experiment.name),
            "experiment name must not be empty",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
