//! Prometheus metrics for the experiment core.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup **before** running any
//! sweep or episode. The helper functions (`inc_sweep`, `record_step_latency`,
//! …) are no-ops if `init_metrics` was never called, so the core is always
//! safe to run — observability simply degrades gracefully.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `secm_sweeps_total` | Counter | `outcome` |
//! | `secm_samples_total` | Counter | — |
//! | `secm_episodes_total` | Counter | `outcome` |
//! | `secm_episode_steps_total` | Counter | — |
//! | `secm_spots_total` | Counter | `outcome` |
//! | `secm_actuator_faults_total` | Counter | — |
//! | `secm_step_duration_seconds` | Histogram | `phase` |

use crate::ExperimentError;
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;
use std::time::Duration;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All Prometheus metrics for the experiment core, bundled together so they
/// can be stored in a single [`OnceLock`] and initialised atomically.
pub struct Metrics {
    /// Prometheus registry that owns all metric descriptors.
    pub registry: Registry,
    /// Sweeps finished, by termination outcome.
    pub sweeps_total: CounterVec,
    /// Samples recorded across all sweeps and episodes.
    pub samples_total: IntCounter,
    /// Control-loop episodes finished, by termination outcome.
    pub episodes_total: CounterVec,
    /// Control-loop steps executed.
    pub episode_steps_total: IntCounter,
    /// Spots attempted by the orchestrator, by outcome.
    pub spots_total: CounterVec,
    /// Actuator communication faults observed.
    pub actuator_faults_total: IntCounter,
    /// Per-step latency (command + readback + settling) by phase.
    pub step_duration: HistogramVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all Prometheus metrics and register them with a private
/// registry.
///
/// Must be called once at process startup before any sweep or episode runs.
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`ExperimentError::Other`] if metric construction or registry
/// registration fails (e.g., duplicate descriptor names).
pub fn init_metrics() -> Result<(), ExperimentError> {
    if METRICS.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let sweeps_total = CounterVec::new(
        Opts::new("secm_sweeps_total", "Sweeps finished by outcome"),
        &["outcome"],
    )
    .map_err(|e| ExperimentError::Other(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(sweeps_total.clone()))
        .map_err(|e| ExperimentError::Other(format!("metrics registration failed: {e}")))?;

    let samples_total = IntCounter::new("secm_samples_total", "Samples recorded")
        .map_err(|e| ExperimentError::Other(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(samples_total.clone()))
        .map_err(|e| ExperimentError::Other(format!("metrics registration failed: {e}")))?;

    let episodes_total = CounterVec::new(
        Opts::new("secm_episodes_total", "Control episodes finished by outcome"),
        &["outcome"],
    )
    .map_err(|e| ExperimentError::Other(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(episodes_total.clone()))
        .map_err(|e| ExperimentError::Other(format!("metrics registration failed: {e}")))?;

    let episode_steps_total = IntCounter::new("secm_episode_steps_total", "Control steps executed")
        .map_err(|e| ExperimentError::Other(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(episode_steps_total.clone()))
        .map_err(|e| ExperimentError::Other(format!("metrics registration failed: {e}")))?;

    let spots_total = CounterVec::new(
        Opts::new("secm_spots_total", "Spots attempted by outcome"),
        &["outcome"],
    )
    .map_err(|e| ExperimentError::Other(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(spots_total.clone()))
        .map_err(|e| ExperimentError::Other(format!("metrics registration failed: {e}")))?;

    let actuator_faults_total =
        IntCounter::new("secm_actuator_faults_total", "Actuator communication faults")
            .map_err(|e| ExperimentError::Other(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(actuator_faults_total.clone()))
        .map_err(|e| ExperimentError::Other(format!("metrics registration failed: {e}")))?;

    let step_duration = HistogramVec::new(
        HistogramOpts::new(
            "secm_step_duration_seconds",
            "Per-step duration including settling delay",
        ),
        &["phase"],
    )
    .map_err(|e| ExperimentError::Other(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(step_duration.clone()))
        .map_err(|e| ExperimentError::Other(format!("metrics registration failed: {e}")))?;

    // If another thread raced us, the first one wins — both initializations
    // produce identical metric descriptors, so neither outcome is incorrect.
    let _ = METRICS.set(Metrics {
        registry,
        sweeps_total,
        samples_total,
        episodes_total,
        episode_steps_total,
        spots_total,
        actuator_faults_total,
        step_duration,
    });

    Ok(())
}

/// Return a reference to the initialised [`Metrics`], or `None` if
/// [`init_metrics`] has not been called yet.
fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

// ── Public helper functions ────────────────────────────────────────────────

/// Record one finished sweep with its termination outcome.
///
/// No-op if metrics have not been initialised.
pub fn inc_sweep(outcome: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.sweeps_total.get_metric_with_label_values(&[outcome]) {
            c.inc();
        }
    }
}

/// Record `n` newly collected samples.
///
/// No-op if metrics have not been initialised.
pub fn add_samples(n: u64) {
    if let Some(m) = metrics() {
        m.samples_total.inc_by(n);
    }
}

/// Record one finished control episode with its termination outcome.
///
/// No-op if metrics have not been initialised.
pub fn inc_episode(outcome: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.episodes_total.get_metric_with_label_values(&[outcome]) {
            c.inc();
        }
    }
}

/// Record one executed control-loop step.
///
/// No-op if metrics have not been initialised.
pub fn inc_episode_step() {
    if let Some(m) = metrics() {
        m.episode_steps_total.inc();
    }
}

/// Record one attempted spot with its outcome (`"ok"` / `"err"`).
///
/// No-op if metrics have not been initialised.
pub fn inc_spot(outcome: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.spots_total.get_metric_with_label_values(&[outcome]) {
            c.inc();
        }
    }
}

/// Record one actuator communication fault.
///
/// No-op if metrics have not been initialised.
pub fn inc_actuator_fault() {
    if let Some(m) = metrics() {
        m.actuator_faults_total.inc();
    }
}

/// Record the duration of one step (command + readback + settling).
///
/// No-op if metrics have not been initialised.
pub fn record_step_latency(phase: &str, d: Duration) {
    if let Some(m) = metrics() {
        if let Ok(h) = m.step_duration.get_metric_with_label_values(&[phase]) {
            h.observe(d.as_secs_f64());
        }
    }
}

/// Encode all registered metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics have not been initialised.
///
/// # Errors
///
/// Returns [`ExperimentError::Other`] if encoding fails.
pub fn export_text() -> Result<String, ExperimentError> {
    let Some(m) = metrics() else {
        return Ok(String::new());
    };

    let families = m.registry.gather();
    let mut buf = Vec::new();
    TextEncoder::new()
        .encode(&families, &mut buf)
        .map_err(|e| ExperimentError::Other(format!("metrics encoding failed: {e}")))?;
    String::from_utf8(buf).map_err(|e| ExperimentError::Other(format!("metrics not UTF-8: {e}")))
}
