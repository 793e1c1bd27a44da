// src/core/metrics.rs

//! Defines and registers Prometheus metrics for server monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only
//! once globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, IntGauge, TextEncoder, register_counter, register_counter_vec,
    register_gauge, register_int_gauge,
};

lazy_static! {
    // --- Counters ---
    /// The total number of pool RPCs processed, labeled by operation.
    pub static ref RPCS_TOTAL: CounterVec =
        register_counter_vec!("peridot_pool_rpcs_total", "Total number of pool RPCs processed.", &["op"]).unwrap();
    /// The number of times a pool service on this node became leader.
    pub static ref STEP_UPS_TOTAL: Counter =
        register_counter!("peridot_pool_step_ups_total", "Total number of pool service step-ups.").unwrap();
    /// The number of times a pool service on this node stepped down.
    pub static ref STEP_DOWNS_TOTAL: Counter =
        register_counter!("peridot_pool_step_downs_total", "Total number of pool service step-downs.").unwrap();

    // --- Gauges ---
    /// Open pool handles across all pools served by this node.
    pub static ref OPEN_HANDLES: Gauge =
        register_gauge!("peridot_pool_open_handles", "Number of open pool handles.").unwrap();
    /// The last committed pool map version on this node.
    pub static ref MAP_VERSION: IntGauge =
        register_int_gauge!("peridot_pool_map_version", "Last committed pool map version.").unwrap();
}

/// Gathers all registered metrics in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    encoder
        .encode_to_string(&prometheus::gather())
        .unwrap_or_default()
}
