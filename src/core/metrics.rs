// src/core/metrics.rs

//! Defines and registers Prometheus metrics for fleet monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only
//! once globally for the entire application lifetime.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram, Counter, CounterVec, Gauge,
    Histogram, TextEncoder,
};

lazy_static! {
    // --- Fleet-wide gauges ---
    /// The number of subs currently tracked by the Herd.
    pub static ref SUB_COUNT: Gauge =
        register_gauge!("herd_sub_count", "Number of subs currently registered.").unwrap();
    /// The number of subs currently in the unreachable state.
    pub static ref UNREACHABLE_SUB_COUNT: Gauge =
        register_gauge!("herd_unreachable_sub_count", "Number of subs currently unreachable.").unwrap();
    /// A boolean gauge indicating whether updates are administratively disabled.
    pub static ref UPDATES_DISABLED: Gauge =
        register_gauge!("herd_updates_disabled", "1 if updates are disabled, 0 otherwise.").unwrap();
    /// The size of the installer escalation queue.
    pub static ref INSTALLER_QUEUE_LENGTH: Gauge =
        register_gauge!("herd_installer_queue_length", "Number of subs awaiting installer escalation.").unwrap();

    // --- Fleet-wide counters ---
    /// The total number of completed scan cycles.
    pub static ref SCAN_CYCLES_TOTAL: Counter =
        register_counter!("herd_scan_cycles_total", "Total number of completed scan cycles.").unwrap();
    /// The total number of MDB ingests performed.
    pub static ref MDB_INGESTS_TOTAL: Counter =
        register_counter!("herd_mdb_ingests_total", "Total number of mdb_update calls.").unwrap();
    /// The total number of subs created across all MDB ingests.
    pub static ref SUBS_CREATED_TOTAL: Counter =
        register_counter!("herd_subs_created_total", "Total number of subs created by mdb_update.").unwrap();
    /// The total number of subs deleted across all MDB ingests.
    pub static ref SUBS_DELETED_TOTAL: Counter =
        register_counter!("herd_subs_deleted_total", "Total number of subs deleted by mdb_update.").unwrap();
    /// The total number of poll attempts, labeled by outcome.
    pub static ref POLLS_TOTAL: CounterVec =
        register_counter_vec!("herd_polls_total", "Total number of poll attempts, labeled by outcome.", &["outcome"]).unwrap();
    /// The total number of update pushes sent to subs.
    pub static ref UPDATES_SENT_TOTAL: Counter =
        register_counter!("herd_updates_sent_total", "Total number of update pushes sent to subs.").unwrap();
    /// The total number of installer escalation attempts.
    pub static ref INSTALLER_ATTEMPTS_TOTAL: CounterVec =
        register_counter_vec!("herd_installer_attempts_total", "Total installer attempts, labeled by outcome.", &["outcome"]).unwrap();

    // --- Histograms ---
    /// A histogram of scan cycle durations.
    pub static ref SCAN_CYCLE_DURATION_SECONDS: Histogram =
        register_histogram!("herd_scan_cycle_duration_seconds", "Duration of a full scan cycle, in seconds.").unwrap();
    /// A histogram of per-sub poll durations.
    pub static ref POLL_DURATION_SECONDS: Histogram =
        register_histogram!("herd_poll_duration_seconds", "Duration of a single sub poll, in seconds.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap()
}
