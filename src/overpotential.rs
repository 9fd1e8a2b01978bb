//! Overpotential extraction from sweep data
//!
//! ## Responsibility
//! Turn the potential/current samples of one sweep into a scalar
//! overpotential: convert currents to current densities, select the linear
//! region around the target density, fit a first-degree line by ordinary
//! least squares, and evaluate the potential at which the fitted line
//! crosses the target density.
//!
//! ## Guarantees
//! - Pure: no instrument access, no side effects beyond a debug log event
//! - Degenerate fits are reported as errors, never as ±∞ or NaN
//!
//! ## NOT Responsible For
//! - Producing the sweep data (that belongs to `sweep`)
//! - Deciding what a good overpotential is (that belongs to the reward
//!   strategy in `env`)

use crate::{ExperimentError, SweepRun};
use std::f64::consts::PI;

/// Probe tip diameter calibration constant (source units).
pub const PROBE_DIAMETER: f64 = 0.05;

/// Geometric electrode area of a disc probe with the given diameter.
pub fn probe_area(diameter: f64) -> f64 {
    PI * (0.5 * diameter) * (0.5 * diameter)
}

/// Convert a raw cell current into a current density using the default
/// probe diameter.
pub fn current_density(current: f64) -> f64 {
    current / probe_area(PROBE_DIAMETER)
}

/// Extracts the overpotential at a target current density from a sweep.
///
/// Samples are filtered to the first forward-scan segment, the first
/// `max_index` rows, and an open current-density window around the target;
/// the surviving points are fitted with `density ≈ slope·potential +
/// intercept` and the fit is inverted at `target_density`.
#[derive(Debug, Clone)]
pub struct OverpotentialCalculator {
    target_density: f64,
    window: (f64, f64),
    max_index: usize,
    probe_diameter: f64,
}

impl OverpotentialCalculator {
    /// Calculator with the standard calibration: target density `0.01`,
    /// window `(0.008, 0.015)`, first `250` rows, probe diameter
    /// [`PROBE_DIAMETER`].
    pub fn new() -> Self {
        Self {
            target_density: 0.01,
            window: (0.008, 0.015),
            max_index: 250,
            probe_diameter: PROBE_DIAMETER,
        }
    }

    /// Set the target current density the fit is inverted at.
    pub fn with_target_density(mut self, target_density: f64) -> Self {
        self.target_density = target_density;
        self
    }

    /// Set the open current-density window samples must fall in.
    pub fn with_window(mut self, low: f64, high: f64) -> Self {
        self.window = (low, high);
        self
    }

    /// Set the maximum row index considered for the fit.
    pub fn with_max_index(mut self, max_index: usize) -> Self {
        self.max_index = max_index;
        self
    }

    /// Set the probe diameter used for the current→density conversion.
    pub fn with_probe_diameter(mut self, diameter: f64) -> Self {
        self.probe_diameter = diameter;
        self
    }

    /// The configured target current density.
    pub fn target_density(&self) -> f64 {
        self.target_density
    }

    /// Compute the overpotential for one sweep.
    ///
    /// # Errors
    ///
    /// - [`ExperimentError::InsufficientData`] if fewer than 2 samples
    ///   survive filtering.
    /// - [`ExperimentError::DivisionByZero`] if the fitted slope is zero
    ///   (including the all-equal-potential case, where the fit itself is
    ///   degenerate).
    pub fn compute(&self, run: &SweepRun) -> Result<f64, ExperimentError> {
        let area = probe_area(self.probe_diameter);
        let points: Vec<(f64, f64)> = run
            .samples()
            .iter()
            .enumerate()
            .filter(|(index, sample)| *index < self.max_index && sample.scan == 1)
            .map(|(_, sample)| (sample.potential_applied, sample.current / area))
            .filter(|(_, density)| self.window.0 < *density && *density < self.window.1)
            .collect();

        if points.len() < 2 {
            return Err(ExperimentError::InsufficientData {
                points: points.len(),
            });
        }

        let (slope, intercept) = linear_fit(&points)?;
        if slope == 0.0 {
            return Err(ExperimentError::DivisionByZero);
        }

        let overpotential = (self.target_density - intercept) / slope;
        tracing::debug!(
            target: "secm::overpotential",
            points = points.len(),
            slope,
            intercept,
            overpotential,
            "linear fit inverted at target density"
        );
        Ok(overpotential)
    }
}

impl Default for OverpotentialCalculator {
    fn default() -> Self {
        Self::new()
    }
}

/// Ordinary least-squares fit of `y ≈ slope·x + intercept`.
///
/// The caller guarantees at least 2 points. A zero spread in `x` leaves the
/// slope undefined and is reported as a degenerate fit.
fn linear_fit(points: &[(f64, f64)]) -> Result<(f64, f64), ExperimentError> {
    let n = points.len() as f64;
    let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;

    let sxy: f64 = points
        .iter()
        .map(|(x, y)| (x - mean_x) * (y - mean_y))
        .sum();
    let sxx: f64 = points.iter().map(|(x, _)| (x - mean_x) * (x - mean_x)).sum();

    if sxx == 0.0 {
        return Err(ExperimentError::DivisionByZero);
    }

    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;
    Ok((slope, intercept))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Sample;

    /// Build a run whose current corresponds to `density = slope·p + b`.
    fn linear_run(potentials: &[f64], slope: f64, intercept: f64, scan: u32) -> SweepRun {
        let area = probe_area(PROBE_DIAMETER);
        let mut run = SweepRun::new();
        for (i, p) in potentials.iter().enumerate() {
            run.push(Sample {
                elapsed_s: i as f64 * 0.5,
                potential: *p,
                current: (slope * p + intercept) * area,
                potential_applied: *p,
                scan,
            });
        }
        run
    }

    #[test]
    fn test_compute_recovers_overpotential_of_synthetic_linear_data() {
        // density = 2·potential + 0.001 → crossing 0.01 at 0.0045
        let run = linear_run(&[0.004, 0.005, 0.006], 2.0, 0.001, 1);
        let eta = OverpotentialCalculator::new()
            .compute(&run)
            .expect("fit succeeds");
        assert!((eta - 0.0045).abs() < 1e-12, "got {eta}");
    }

    #[test]
    fn test_compute_rejects_fewer_than_two_filtered_points() {
        // Only 0.005 lands inside the (0.008, 0.015) density window.
        let run = linear_run(&[0.005, 0.2, 0.4], 2.0, 0.001, 1);
        let err = OverpotentialCalculator::new().compute(&run);
        assert!(matches!(
            err,
            Err(ExperimentError::InsufficientData { points: 1 })
        ));
    }

    #[test]
    fn test_compute_rejects_empty_run() {
        let err = OverpotentialCalculator::new().compute(&SweepRun::new());
        assert!(matches!(
            err,
            Err(ExperimentError::InsufficientData { points: 0 })
        ));
    }

    #[test]
    fn test_compute_reports_zero_slope_instead_of_infinity() {
        // Flat density inside the window: slope is exactly zero.
        let area = probe_area(PROBE_DIAMETER);
        let mut run = SweepRun::new();
        for (i, p) in [0.1, 0.2, 0.3].iter().enumerate() {
            run.push(Sample {
                elapsed_s: i as f64,
                potential: *p,
                current: 0.01 * area,
                potential_applied: *p,
                scan: 1,
            });
        }
        let err = OverpotentialCalculator::new().compute(&run);
        assert!(matches!(err, Err(ExperimentError::DivisionByZero)));
    }

    #[test]
    fn test_compute_reports_degenerate_fit_when_potentials_coincide() {
        let area = probe_area(PROBE_DIAMETER);
        let mut run = SweepRun::new();
        for (i, d) in [0.009, 0.012].iter().enumerate() {
            run.push(Sample {
                elapsed_s: i as f64,
                potential: 0.3,
                current: d * area,
                potential_applied: 0.3,
                scan: 1,
            });
        }
        let err = OverpotentialCalculator::new().compute(&run);
        assert!(matches!(err, Err(ExperimentError::DivisionByZero)));
    }

    #[test]
    fn test_compute_ignores_later_scan_segments() {
        let mut run = linear_run(&[0.004, 0.005, 0.006], 2.0, 0.001, 1);
        // A second scan with a wildly different response must not bias the fit.
        let area = probe_area(PROBE_DIAMETER);
        for (i, p) in [0.004, 0.005, 0.006].iter().enumerate() {
            run.push(Sample {
                elapsed_s: 10.0 + i as f64,
                potential: *p,
                current: (1.0 * p + 0.005) * area,
                potential_applied: *p,
                scan: 2,
            });
        }
        let eta = OverpotentialCalculator::new()
            .compute(&run)
            .expect("fit succeeds");
        assert!((eta - 0.0045).abs() < 1e-12);
    }

    #[test]
    fn test_compute_ignores_rows_past_max_index() {
        // First two rows carry the real response; rows past the cutoff
        // would pull the crossing elsewhere.
        let mut run = linear_run(&[0.004, 0.006], 2.0, 0.001, 1);
        let area = probe_area(PROBE_DIAMETER);
        run.push(Sample {
            elapsed_s: 99.0,
            potential: 0.0052,
            current: 0.014 * area,
            potential_applied: 0.0052,
            scan: 1,
        });
        let eta = OverpotentialCalculator::new()
            .with_max_index(2)
            .compute(&run)
            .expect("fit succeeds");
        assert!((eta - 0.0045).abs() < 1e-12);
    }

    #[test]
    fn test_current_density_uses_probe_area() {
        let current = 1.0e-6;
        let expected = current / (PI * 0.025 * 0.025);
        assert!((current_density(current) - expected).abs() < 1e-12);
    }
}
