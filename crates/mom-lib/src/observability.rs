//! Observability infrastructure for the MOM daemons
//!
//! Provides:
//! - Prometheus metrics (cycle latency, collection latency, monitored guests, failure counters)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for control cycle latency (in seconds)
const CYCLE_BUCKETS: &[f64] = &[0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0];

/// Histogram buckets for collection latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<MomMetricsInner> = OnceLock::new();

/// Inner metrics structure that holds the actual Prometheus metrics
struct MomMetricsInner {
    cycle_latency_seconds: Histogram,
    collection_latency_seconds: Histogram,
    guests_monitored: IntGauge,
    cycles: IntCounterVec,
    rpc_failures: IntCounterVec,
    policy_failures: IntCounter,
    controller_failures: IntCounter,
    collection_errors: IntCounter,
    balloon_operations: IntCounter,
}

impl MomMetricsInner {
    fn new() -> Self {
        Self {
            cycle_latency_seconds: register_histogram!(
                "mom_cycle_latency_seconds",
                "Time spent in one host policy control cycle",
                CYCLE_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_latency_seconds"),

            collection_latency_seconds: register_histogram!(
                "mom_collection_latency_seconds",
                "Time spent running all collectors of a monitor",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register collection_latency_seconds"),

            guests_monitored: register_int_gauge!(
                "mom_guests_monitored",
                "Number of guests currently being monitored"
            )
            .expect("Failed to register guests_monitored"),

            cycles: register_int_counter_vec!(
                "mom_policy_cycles_total",
                "Control cycles by outcome",
                &["outcome"]
            )
            .expect("Failed to register policy_cycles"),

            rpc_failures: register_int_counter_vec!(
                "mom_rpc_failures_total",
                "Failed guest RPCs by message kind",
                &["message"]
            )
            .expect("Failed to register rpc_failures"),

            policy_failures: register_int_counter!(
                "mom_policy_failures_total",
                "Total number of allocator failures"
            )
            .expect("Failed to register policy_failures"),

            controller_failures: register_int_counter!(
                "mom_controller_failures_total",
                "Total number of controller failures"
            )
            .expect("Failed to register controller_failures"),

            collection_errors: register_int_counter!(
                "mom_collection_errors_total",
                "Total number of collector errors"
            )
            .expect("Failed to register collection_errors"),

            balloon_operations: register_int_counter!(
                "mom_balloon_operations_total",
                "Total number of balloon resize requests"
            )
            .expect("Failed to register balloon_operations"),
        }
    }
}

/// MOM metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct MomMetrics {
    _private: (),
}

impl Default for MomMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MomMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MomMetrics")
    }
}

impl MomMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(MomMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &MomMetricsInner {
        GLOBAL_METRICS.get_or_init(MomMetricsInner::new)
    }

    pub fn observe_cycle_latency(&self, duration_secs: f64) {
        self.inner().cycle_latency_seconds.observe(duration_secs);
    }

    pub fn observe_collection_latency(&self, duration_secs: f64) {
        self.inner().collection_latency_seconds.observe(duration_secs);
    }

    pub fn set_guests_monitored(&self, count: i64) {
        self.inner().guests_monitored.set(count);
    }

    /// Count a finished cycle under its outcome label
    pub fn inc_cycles(&self, outcome: &str) {
        self.inner().cycles.with_label_values(&[outcome]).inc();
    }

    pub fn inc_rpc_failures(&self, message: &str) {
        self.inner().rpc_failures.with_label_values(&[message]).inc();
    }

    pub fn inc_policy_failures(&self) {
        self.inner().policy_failures.inc();
    }

    pub fn inc_controller_failures(&self) {
        self.inner().controller_failures.inc();
    }

    pub fn inc_collection_errors(&self) {
        self.inner().collection_errors.inc();
    }

    pub fn inc_balloon_operations(&self) {
        self.inner().balloon_operations.inc();
    }
}

/// Structured logger for daemon events
///
/// Provides consistent JSON-formatted logging for lifecycle, guest and
/// balloon events.
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    daemon: String,
}

impl StructuredLogger {
    pub fn new(daemon: impl Into<String>) -> Self {
        Self {
            daemon: daemon.into(),
        }
    }

    /// Log daemon startup
    pub fn log_startup(&self, version: &str) {
        info!(
            event = "daemon_started",
            daemon = %self.daemon,
            version = %version,
            "MOM daemon started"
        );
    }

    /// Log daemon shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "daemon_shutdown",
            daemon = %self.daemon,
            reason = %reason,
            "MOM daemon shutting down"
        );
    }

    /// Log a component found dead by the liveness check
    pub fn log_component_died(&self, component: &str) {
        warn!(
            event = "component_died",
            daemon = %self.daemon,
            component = %component,
            "Component is no longer running"
        );
    }

    pub fn log_guest_added(&self, guest: &str, domain_id: &str) {
        info!(
            event = "guest_added",
            daemon = %self.daemon,
            guest = %guest,
            domain_id = %domain_id,
            "Started monitoring guest"
        );
    }

    pub fn log_guest_removed(&self, guest: &str, reason: &str) {
        info!(
            event = "guest_removed",
            daemon = %self.daemon,
            guest = %guest,
            reason = %reason,
            "Stopped monitoring guest"
        );
    }

    /// Log a balloon resize request
    pub fn log_balloon(&self, guest: &str, current_mb: f64, target_mb: f64) {
        info!(
            event = "balloon_set",
            daemon = %self.daemon,
            guest = %guest,
            current_mb = current_mb,
            target_mb = target_mb,
            "Ballooning guest"
        );
    }

    /// Log a balloon target clamped to the guest's maximum memory
    pub fn log_balloon_clamped(&self, guest: &str, requested_mb: f64, max_mb: f64) {
        warn!(
            event = "balloon_clamped",
            daemon = %self.daemon,
            guest = %guest,
            requested_mb = requested_mb,
            max_mb = max_mb,
            "Balloon target exceeds guest maximum memory"
        );
    }

    /// Log the end of a control cycle
    pub fn log_cycle(&self, outcome: &str, guests: usize, elapsed_secs: f64) {
        info!(
            event = "policy_cycle",
            daemon = %self.daemon,
            outcome = %outcome,
            guests = guests,
            elapsed_secs = elapsed_secs,
            "Control cycle finished"
        );
    }
}
