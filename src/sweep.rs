//! Stepped linear-sweep execution with structured tracing.
//!
//! The controller drives one potential sweep against an exclusively-owned
//! [`Actuator`]: per step it commands the output, reads back the actual
//! values, records a synchronized [`Sample`], advances the setpoint, and
//! then sleeps for the settling interval dictated by the scan rate.
//!
//! A sweep may be aborted between steps by an external cancellation signal
//! or by an actuator fault; in both cases the samples collected so far are
//! returned to the caller, who decides persistence or retry.

use crate::{
    actuator::{fault_termination, Actuator},
    metrics, ExperimentError, Sample, SweepOutcome, SweepRun, SweepTermination,
};
use tokio::sync::watch;
use tracing::{info, warn, Instrument, Span};

/// Parameters of one linear potential sweep.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SweepParameters {
    /// Potential applied at the first step (V).
    pub start_potential: f64,
    /// Potential the sweep runs toward (V).
    pub end_potential: f64,
    /// Rate of potential change (V/s); fixes the per-step settling delay.
    pub scan_rate: f64,
    /// Potential increment per step (V); sign selects the direction.
    pub step_potential: f64,
}

impl SweepParameters {
    /// Check the sweep preconditions.
    ///
    /// A step potential that does not drive the sweep toward the end
    /// potential would loop in the wrong direction or never terminate, so
    /// it is rejected here instead of being detected mid-run.
    ///
    /// # Errors
    ///
    /// [`ExperimentError::InvalidSweepRange`] naming the violated rule.
    pub fn validate(&self) -> Result<(), ExperimentError> {
        let fail = |reason: &'static str| {
            Err(ExperimentError::InvalidSweepRange {
                reason,
                start: self.start_potential,
                end: self.end_potential,
                step_potential: self.step_potential,
                scan_rate: self.scan_rate,
            })
        };

        if !self.start_potential.is_finite()
            || !self.end_potential.is_finite()
            || !self.step_potential.is_finite()
            || !self.scan_rate.is_finite()
        {
            return fail("parameters must be finite");
        }
        if self.scan_rate <= 0.0 {
            return fail("scan rate must be positive");
        }
        if self.step_potential == 0.0 {
            return fail("step potential must be nonzero");
        }
        if (self.end_potential - self.start_potential) * self.step_potential <= 0.0 {
            return fail("step potential must drive the sweep toward the end potential");
        }
        Ok(())
    }

    /// Number of discrete steps the sweep executes:
    /// `round((end − start) / step)`.
    pub fn step_count(&self) -> usize {
        ((self.end_potential - self.start_potential) / self.step_potential).round() as usize
    }

    /// Settling delay between steps, from the instrument's scan-rate
    /// contract.
    pub fn step_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.step_potential.abs() / self.scan_rate)
    }
}

/// Drives one stepped linear sweep against an actuator.
pub struct SweepController {
    params: SweepParameters,
    cancel: Option<watch::Receiver<bool>>,
}

impl SweepController {
    /// Controller for the given sweep parameters.
    pub fn new(params: SweepParameters) -> Self {
        Self {
            params,
            cancel: None,
        }
    }

    /// Attach an external cancellation signal, observed between steps.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// The configured sweep parameters.
    pub fn params(&self) -> &SweepParameters {
        &self.params
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Execute the sweep.
    ///
    /// On success the outcome holds exactly `step_count()` samples with
    /// strictly increasing elapsed time, and the actuator is left at the
    /// last commanded potential — resetting or powering down is the
    /// caller's responsibility.
    ///
    /// # Errors
    ///
    /// [`ExperimentError::InvalidSweepRange`] if the preconditions fail; no
    /// instrument command is issued in that case. Mid-run faults do **not**
    /// return `Err` — they terminate the outcome with
    /// [`SweepTermination::ActuatorFault`] so the partial run survives.
    pub async fn run<A: Actuator + ?Sized>(
        &self,
        actuator: &mut A,
    ) -> Result<SweepOutcome, ExperimentError> {
        self.params.validate()?;

        let step_count = self.params.step_count();
        let interval = self.params.step_interval();

        let span = tracing::info_span!(
            "sweep.run",
            start = self.params.start_potential,
            end = self.params.end_potential,
            steps = step_count as u64,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        async move {
            let mut run = SweepRun::new();
            let mut applied = self.params.start_potential;
            let started = tokio::time::Instant::now();
            let mut termination = SweepTermination::Completed;

            for step in 0..step_count {
                if self.is_cancelled() {
                    info!(
                        target: "secm::sweep",
                        step,
                        "cancellation observed, aborting sweep"
                    );
                    termination = SweepTermination::Cancelled { after_steps: step };
                    break;
                }

                let step_started = tokio::time::Instant::now();

                let sample = match Self::command_and_read(actuator, applied, started).await {
                    Ok(sample) => sample,
                    Err(e) => {
                        warn!(
                            target: "secm::sweep",
                            step,
                            error = %e,
                            "actuator fault, aborting remaining steps"
                        );
                        metrics::inc_actuator_fault();
                        termination = fault_termination(&e);
                        break;
                    }
                };

                run.push(sample);
                metrics::add_samples(1);

                applied += self.params.step_potential;
                tokio::time::sleep(interval).await;
                metrics::record_step_latency("sweep", step_started.elapsed());
            }

            let outcome_label = termination_label(&termination);
            Span::current().record("duration_ms", started.elapsed().as_millis() as u64);
            Span::current().record("outcome", outcome_label);
            metrics::inc_sweep(outcome_label);

            info!(
                target: "secm::sweep",
                samples = run.len(),
                outcome = outcome_label,
                "sweep finished"
            );

            Ok(SweepOutcome { run, termination })
        }
        .instrument(span)
        .await
    }

    async fn command_and_read<A: Actuator + ?Sized>(
        actuator: &mut A,
        applied: f64,
        started: tokio::time::Instant,
    ) -> Result<Sample, ExperimentError> {
        actuator.set_output(applied).await?;
        let actuals = actuator.read_actuals().await?;
        Ok(Sample {
            elapsed_s: started.elapsed().as_secs_f64(),
            potential: actuals.potential,
            current: actuals.current,
            potential_applied: actuals.potential_applied,
            scan: 1,
        })
    }
}

/// Stable label for a termination variant, used in logs and metrics.
pub(crate) fn termination_label(termination: &SweepTermination) -> &'static str {
    match termination {
        SweepTermination::Completed => "completed",
        SweepTermination::Cancelled { .. } => "cancelled",
        SweepTermination::ActuatorFault { .. } => "fault",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(start: f64, end: f64, scan_rate: f64, step: f64) -> SweepParameters {
        SweepParameters {
            start_potential: start,
            end_potential: end,
            scan_rate,
            step_potential: step,
        }
    }

    #[test]
    fn test_validate_accepts_upward_and_downward_sweeps() {
        assert!(params(0.0, 0.5, 0.005, 0.01).validate().is_ok());
        assert!(params(0.5, 0.0, 0.005, -0.01).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_nonpositive_scan_rate() {
        let err = params(0.0, 0.5, 0.0, 0.01).validate();
        assert!(matches!(
            err,
            Err(ExperimentError::InvalidSweepRange { reason, .. })
                if reason.contains("scan rate")
        ));
    }

    #[test]
    fn test_validate_rejects_zero_step() {
        let err = params(0.0, 0.5, 0.005, 0.0).validate();
        assert!(matches!(
            err,
            Err(ExperimentError::InvalidSweepRange { reason, .. })
                if reason.contains("nonzero")
        ));
    }

    #[test]
    fn test_validate_rejects_step_against_sweep_direction() {
        let err = params(0.0, 0.5, 0.005, -0.01).validate();
        assert!(err.is_err());
        let err = params(0.5, 0.0, 0.005, 0.01).validate();
        assert!(err.is_err());
    }

    #[test]
    fn test_validate_rejects_zero_span() {
        assert!(params(0.3, 0.3, 0.005, 0.01).validate().is_err());
    }

    #[test]
    fn test_validate_rejects_non_finite_parameters() {
        assert!(params(f64::NAN, 0.5, 0.005, 0.01).validate().is_err());
        assert!(params(0.0, f64::INFINITY, 0.005, 0.01).validate().is_err());
    }

    #[test]
    fn test_step_count_rounds_to_nearest() {
        assert_eq!(params(0.0, 0.0122, 0.005, 0.00244).step_count(), 5);
        assert_eq!(params(0.0, 0.1, 0.005, 0.03).step_count(), 3);
    }

    #[test]
    fn test_step_interval_uses_absolute_step() {
        let p = params(0.5, 0.0, 0.005, -0.00244);
        let expected = 0.00244 / 0.005;
        assert!((p.step_interval().as_secs_f64() - expected).abs() < 1e-12);
    }
}
