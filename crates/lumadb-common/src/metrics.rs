//! Metrics for the data-handle layer
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::must_use_candidate)]

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use once_cell::sync::OnceCell;

static DESCRIBED: OnceCell<()> = OnceCell::new();

/// Register metric descriptions with the installed recorder (once)
pub fn describe() {
    DESCRIBED.get_or_init(|| {
        describe_counter!("lumadb_dhandle_opens_total", "Data sources opened through a handle");
        describe_counter!("lumadb_dhandle_closes_total", "Data sources closed through a handle");
        describe_counter!("lumadb_dhandle_busy_total", "Access requests rejected as busy");
        describe_counter!("lumadb_dhandle_sweep_closed_total", "Idle handles closed by the sweep");
        describe_counter!("lumadb_dhandle_sweep_removed_total", "Handles discarded by the sweep");
        describe_histogram!("lumadb_dhandle_sweep_duration_ms", "Duration of a sweep pass");
        describe_gauge!("lumadb_dhandle_registry_size", "Handles present in the registry");
    });
}

// ============================================================================
// Handle Metrics
// ============================================================================

/// Record a data source open
pub fn record_handle_open(handle_type: &'static str) {
    counter!("lumadb_dhandle_opens_total", "type" => handle_type).increment(1);
}

/// Record a data source close
pub fn record_handle_close(handle_type: &'static str) {
    counter!("lumadb_dhandle_closes_total", "type" => handle_type).increment(1);
}

/// Record an access request that was rejected with `Busy`
pub fn record_handle_busy(mode: &'static str) {
    counter!("lumadb_dhandle_busy_total", "mode" => mode).increment(1);
}

// ============================================================================
// Sweep Metrics
// ============================================================================

/// Record the outcome of one sweep pass
pub fn record_sweep(closed: u64, removed: u64, duration_ms: f64) {
    counter!("lumadb_dhandle_sweep_closed_total").increment(closed);
    counter!("lumadb_dhandle_sweep_removed_total").increment(removed);
    histogram!("lumadb_dhandle_sweep_duration_ms").record(duration_ms);
}

/// Update the registry size gauge
pub fn set_registry_size(handles: usize) {
    gauge!("lumadb_dhandle_registry_size").set(handles as f64);
}
