//! Prometheus Metrics Module
//!
//! Exposes price simulator metrics via the `metrics` facade.
//!
//! # Metrics Categories
//!
//! - **Ticks**: Scheduler ticks and their duration
//! - **Samples**: Samples generated and callback deliveries
//! - **Failures**: Panicking callbacks, samples nobody received
//! - **Registry**: Tracked mint and subscriber counts
//!
//! Recording is a no-op until [`init_metrics`] installs the recorder.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Safe to call more than once; later calls return the first handle.
///
/// # Errors
///
/// Returns an error if another global recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();

    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "price_sim_ticks_total",
        "Total scheduler ticks that produced samples"
    );
    describe_counter!(
        "price_sim_samples_total",
        "Total price samples generated"
    );
    describe_counter!(
        "price_sim_deliveries_total",
        "Total samples delivered to subscriber callbacks"
    );
    describe_counter!(
        "price_sim_callback_panics_total",
        "Total subscriber callbacks that panicked during fan-out"
    );
    describe_counter!(
        "price_sim_unobserved_samples_total",
        "Samples sent while no broadcast receiver was attached"
    );

    describe_gauge!("price_sim_tracked_mints", "Number of tracked mints");
    describe_gauge!("price_sim_subscribers", "Number of registered callbacks");

    describe_histogram!(
        "price_sim_tick_duration_seconds",
        "Time to generate and fan out one tick"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record one tick and how many samples it produced.
pub fn record_tick(samples: usize, duration: Duration) {
    counter!("price_sim_ticks_total").increment(1);
    counter!("price_sim_samples_total").increment(samples as u64);
    histogram!("price_sim_tick_duration_seconds").record(duration.as_secs_f64());
}

/// Record callback deliveries.
pub fn record_deliveries(count: u64) {
    counter!("price_sim_deliveries_total").increment(count);
}

/// Record panicking callbacks.
pub fn record_callback_panics(count: u64) {
    counter!("price_sim_callback_panics_total").increment(count);
}

/// Record a sample that no broadcast receiver saw.
pub fn record_unobserved_sample() {
    counter!("price_sim_unobserved_samples_total").increment(1);
}

/// Update the tracked mint count.
pub fn set_tracked_mints(count: usize) {
    gauge!("price_sim_tracked_mints").set(count as f64);
}

/// Update the subscriber count.
pub fn set_subscribers(count: usize) {
    gauge!("price_sim_subscribers").set(count as f64);
}

// =============================================================================
// Tests
// =============================================================================
