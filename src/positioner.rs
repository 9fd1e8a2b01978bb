//! Probe positioner abstraction and simulated implementation
//!
//! The [`Positioner`] trait covers the three movements the experiment core
//! needs from an SECM stage: advancing to the next spot, parking at the
//! wash/rest position, and starting a fresh substrate. [`SimulatedStage`]
//! tracks positions in memory for tests and simulation mode.

use crate::ExperimentError;
use async_trait::async_trait;

/// Capability interface for an SECM-like probe positioner.
///
/// Exclusively owned by the episode that drives it; movement commands are
/// serialized through the single owner.
#[async_trait]
pub trait Positioner: Send {
    /// Advance the probe by `distance` (source units) toward the next spot.
    ///
    /// # Errors
    ///
    /// [`ExperimentError::ActuatorCommunication`] on any I/O fault.
    async fn advance(&mut self, distance: f64) -> Result<(), ExperimentError>;

    /// Move the probe to the parked wash/rest position.
    ///
    /// # Errors
    ///
    /// [`ExperimentError::ActuatorCommunication`] on any I/O fault.
    async fn park(&mut self) -> Result<(), ExperimentError>;

    /// Begin a new substrate: reset the spot origin for a fresh sample.
    ///
    /// # Errors
    ///
    /// [`ExperimentError::ActuatorCommunication`] on any I/O fault.
    async fn begin_new_sample(&mut self) -> Result<(), ExperimentError>;
}

// ============================================================================
// Simulated stage (testing / simulation mode)
// ============================================================================

/// In-memory stage model tracking cumulative probe position.
#[derive(Debug, Default)]
pub struct SimulatedStage {
    position: f64,
    parked: bool,
    samples_started: u32,
    park_calls: u32,
}

impl SimulatedStage {
    /// Create a stage at the origin, not parked.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cumulative distance advanced since the last new sample.
    pub fn position(&self) -> f64 {
        self.position
    }

    /// Whether the probe currently sits at the wash position.
    pub fn is_parked(&self) -> bool {
        self.parked
    }

    /// Number of substrates started.
    pub fn samples_started(&self) -> u32 {
        self.samples_started
    }

    /// Number of park commands received.
    pub fn park_calls(&self) -> u32 {
        self.park_calls
    }
}

#[async_trait]
impl Positioner for SimulatedStage {
    async fn advance(&mut self, distance: f64) -> Result<(), ExperimentError> {
        self.position += distance;
        self.parked = false;
        Ok(())
    }

    async fn park(&mut self) -> Result<(), ExperimentError> {
        self.parked = true;
        self.park_calls += 1;
        Ok(())
    }

    async fn begin_new_sample(&mut self) -> Result<(), ExperimentError> {
        self.position = 0.0;
        self.parked = false;
        self.samples_started += 1;
        Ok(())
    }
}
