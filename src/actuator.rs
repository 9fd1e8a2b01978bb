//! Potentiostat abstraction and simulated implementation
//!
//! Provides the [`Actuator`] trait — the narrow capability surface the core
//! needs from a voltage/current source-measure instrument — and
//! [`SimulatedCell`], a deterministic electrochemical-cell model used in
//! tests and simulation mode.
//!
//! Real-instrument drivers live outside this crate; anything that can
//! `set_output` and `read_actuals` can drive an experiment. The trait does
//! not impose a call timeout — a non-responding instrument blocks the
//! current step, so driver implementations are expected to enforce their
//! own I/O deadlines.

use crate::{ExperimentError, SweepTermination};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Snapshot of the instrument's live readback channels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActualValues {
    /// Measured working-electrode potential (V).
    pub potential: f64,
    /// Measured cell current (A).
    pub current: f64,
    /// Applied potential as reported by the instrument (V).
    pub potential_applied: f64,
}

/// Capability interface for a potentiostat-like actuator.
///
/// Implementations are exclusively owned by the sweep/episode that drives
/// them (`&mut self` on every command), which serializes all instrument
/// commands through a single owner. The trait is object-safe so reward
/// strategies can borrow the actuator as `&mut dyn Actuator`.
#[async_trait]
pub trait Actuator: Send {
    /// Command the instrument to apply the given output potential (V).
    ///
    /// # Errors
    ///
    /// [`ExperimentError::ActuatorCommunication`] on any I/O fault.
    async fn set_output(&mut self, value: f64) -> Result<(), ExperimentError>;

    /// Read back the instrument's live channels.
    ///
    /// # Errors
    ///
    /// [`ExperimentError::ActuatorCommunication`] on any I/O fault.
    async fn read_actuals(&mut self) -> Result<ActualValues, ExperimentError>;

    /// Whether the instrument output is currently enabled.
    async fn is_enabled(&self) -> bool;

    /// Enable the instrument output.
    ///
    /// # Errors
    ///
    /// [`ExperimentError::ActuatorCommunication`] on any I/O fault.
    async fn enable(&mut self) -> Result<(), ExperimentError>;

    /// Disable the instrument output.
    ///
    /// # Errors
    ///
    /// [`ExperimentError::ActuatorCommunication`] on any I/O fault.
    async fn disable(&mut self) -> Result<(), ExperimentError>;
}

/// Map an actuator failure onto the termination of the surrounding run.
///
/// Keeps the fault message for the record while letting the caller hold on
/// to the samples collected so far.
pub fn fault_termination(err: &ExperimentError) -> SweepTermination {
    SweepTermination::ActuatorFault {
        message: err.to_string(),
    }
}

// ============================================================================
// Simulated cell (testing / simulation mode)
// ============================================================================

/// Deterministic simulated electrochemical cell.
///
/// Models a linear current-density response
/// `density = density_slope · applied + density_intercept` (A/cm² per V)
/// converted to a cell current through the probe area, and a measured
/// potential equal to the applied potential plus a fixed offset. Useful for
/// exercising sweeps and episodes without instrument hardware.
pub struct SimulatedCell {
    /// Slope of the simulated current-density response (A/cm² per V).
    density_slope: f64,
    /// Intercept of the simulated current-density response (A/cm²).
    density_intercept: f64,
    /// Offset between applied and measured potential (V).
    potential_offset: f64,
    /// Probe tip diameter used for the density→current conversion.
    probe_diameter: f64,
    /// Simulated per-command settling latency.
    latency_ms: u64,
    /// Reads that succeed before the cell starts faulting. `None` never
    /// faults.
    fail_after_reads: Option<u32>,
    applied: f64,
    enabled: bool,
    reads: u32,
}

impl SimulatedCell {
    /// Create a cell with a gentle default response
    /// (`density = 2·applied + 0.001`).
    pub fn new() -> Self {
        Self {
            density_slope: 2.0,
            density_intercept: 0.001,
            potential_offset: 0.0,
            probe_diameter: crate::overpotential::PROBE_DIAMETER,
            latency_ms: 0,
            fail_after_reads: None,
            applied: 0.0,
            enabled: false,
            reads: 0,
        }
    }

    /// Set the current-density response `density = slope·applied + intercept`.
    pub fn with_response(mut self, slope: f64, intercept: f64) -> Self {
        self.density_slope = slope;
        self.density_intercept = intercept;
        self
    }

    /// Set the offset between applied and measured potential (V).
    pub fn with_potential_offset(mut self, offset: f64) -> Self {
        self.potential_offset = offset;
        self
    }

    /// Set the probe tip diameter used for the density→current conversion.
    pub fn with_probe_diameter(mut self, diameter: f64) -> Self {
        self.probe_diameter = diameter;
        self
    }

    /// Set a simulated per-command settling latency.
    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Make the cell fault on every read after the first `reads` succeed.
    pub fn failing_after_reads(mut self, reads: u32) -> Self {
        self.fail_after_reads = Some(reads);
        self
    }

    /// The last commanded output potential (V).
    pub fn applied(&self) -> f64 {
        self.applied
    }

    async fn settle(&self) {
        if self.latency_ms > 0 {
            tokio::time::sleep(tokio::time::Duration::from_millis(self.latency_ms)).await;
        }
    }
}

impl Default for SimulatedCell {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Actuator for SimulatedCell {
    async fn set_output(&mut self, value: f64) -> Result<(), ExperimentError> {
        self.settle().await;
        self.applied = value;
        Ok(())
    }

    async fn read_actuals(&mut self) -> Result<ActualValues, ExperimentError> {
        self.settle().await;

        if let Some(limit) = self.fail_after_reads {
            if self.reads >= limit {
                return Err(ExperimentError::ActuatorCommunication(format!(
                    "simulated link failure after {limit} read(s)"
                )));
            }
        }
        self.reads += 1;

        let density = self.density_slope * self.applied + self.density_intercept;
        let area = crate::overpotential::probe_area(self.probe_diameter);
        Ok(ActualValues {
            potential: self.applied + self.potential_offset,
            current: density * area,
            potential_applied: self.applied,
        })
    }

    async fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn enable(&mut self) -> Result<(), ExperimentError> {
        self.enabled = true;
        Ok(())
    }

    async fn disable(&mut self) -> Result<(), ExperimentError> {
        self.enabled = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulated_cell_reads_back_commanded_potential() {
        let mut cell = SimulatedCell::new();
        cell.set_output(0.42).await.expect("set_output");
        let actuals = cell.read_actuals().await.expect("read_actuals");
        assert_eq!(actuals.potential_applied, 0.42);
        assert_eq!(actuals.potential, 0.42);
    }

    #[tokio::test]
    async fn test_simulated_cell_linear_response() {
        let mut cell = SimulatedCell::new().with_response(2.0, 0.001);
        cell.set_output(0.5).await.expect("set_output");
        let actuals = cell.read_actuals().await.expect("read_actuals");

        let expected_density = 2.0 * 0.5 + 0.001;
        let area = crate::overpotential::probe_area(crate::overpotential::PROBE_DIAMETER);
        assert!((actuals.current - expected_density * area).abs() < 1e-15);
    }

    #[tokio::test]
    async fn test_simulated_cell_faults_after_configured_reads() {
        let mut cell = SimulatedCell::new().failing_after_reads(2);
        assert!(cell.read_actuals().await.is_ok());
        assert!(cell.read_actuals().await.is_ok());
        let err = cell.read_actuals().await;
        assert!(matches!(
            err,
            Err(ExperimentError::ActuatorCommunication(_))
        ));
    }

    #[tokio::test]
    async fn test_simulated_cell_enable_disable() {
        let mut cell = SimulatedCell::new();
        assert!(!cell.is_enabled().await);
        cell.enable().await.expect("enable");
        assert!(cell.is_enabled().await);
        cell.disable().await.expect("disable");
        assert!(!cell.is_enabled().await);
    }
}
