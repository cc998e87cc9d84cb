//! Observability infrastructure for slice orchestration
//!
//! Provides:
//! - Prometheus metrics (per-slice latency/throughput, violations, tunnel state, operation latency)
//! - Structured JSON logging with tracing

use prometheus::{
    register_gauge_vec, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, GaugeVec, Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for control-plane operations (in seconds)
const OPERATION_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

static GLOBAL_METRICS: OnceLock<SliceMetricsInner> = OnceLock::new();

struct SliceMetricsInner {
    slice_latency_ms: GaugeVec,
    slice_throughput_mbps: GaugeVec,
    qos_violations_total: IntCounterVec,
    tunnel_state: GaugeVec,
    placement_latency_seconds: Histogram,
    provision_latency_seconds: Histogram,
    placement_failures_total: IntCounterVec,
    rollbacks_total: IntCounter,
    slices_active: IntGauge,
    vnis_allocated: IntGauge,
    command_errors_total: IntCounter,
}

impl SliceMetricsInner {
    fn new() -> Self {
        Self {
            slice_latency_ms: register_gauge_vec!(
                "slice_latency_ms",
                "Last measured one-way latency per slice in milliseconds",
                &["slice"]
            )
            .expect("Failed to register slice_latency_ms"),

            slice_throughput_mbps: register_gauge_vec!(
                "slice_throughput_mbps",
                "Last measured throughput per slice in Mbit/s",
                &["slice"]
            )
            .expect("Failed to register slice_throughput_mbps"),

            qos_violations_total: register_int_counter_vec!(
                "qos_violations_total",
                "QoS contract violations observed per slice",
                &["slice", "kind"]
            )
            .expect("Failed to register qos_violations_total"),

            tunnel_state: register_gauge_vec!(
                "tunnel_state",
                "Tunnel lifecycle state (0=requested, 1=up, 2=tearing_down, 3=released)",
                &["vni"]
            )
            .expect("Failed to register tunnel_state"),

            placement_latency_seconds: register_histogram!(
                "slice_placement_latency_seconds",
                "Time spent deciding and reserving a placement",
                OPERATION_BUCKETS.to_vec()
            )
            .expect("Failed to register slice_placement_latency_seconds"),

            provision_latency_seconds: register_histogram!(
                "slice_provision_latency_seconds",
                "End-to-end time from intent to active slice",
                OPERATION_BUCKETS.to_vec()
            )
            .expect("Failed to register slice_provision_latency_seconds"),

            placement_failures_total: register_int_counter_vec!(
                "slice_placement_failures_total",
                "Rejected placements by error code",
                &["reason"]
            )
            .expect("Failed to register slice_placement_failures_total"),

            rollbacks_total: register_int_counter!(
                "slice_rollbacks_total",
                "Total number of slice rollbacks executed"
            )
            .expect("Failed to register slice_rollbacks_total"),

            slices_active: register_int_gauge!(
                "slices_active",
                "Number of slices currently active"
            )
            .expect("Failed to register slices_active"),

            vnis_allocated: register_int_gauge!(
                "vni_pool_allocated",
                "Number of VNIs currently held by tunnels"
            )
            .expect("Failed to register vni_pool_allocated"),

            command_errors_total: register_int_counter!(
                "transport_command_errors_total",
                "Total number of failed network control commands"
            )
            .expect("Failed to register transport_command_errors_total"),
        }
    }
}

/// Slice metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share it.
#[derive(Clone)]
pub struct SliceMetrics {
    _private: (),
}

impl Default for SliceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SliceMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SliceMetrics")
    }
}

impl SliceMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(SliceMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &SliceMetricsInner {
        GLOBAL_METRICS.get_or_init(SliceMetricsInner::new)
    }

    pub fn record_measurement(&self, slice_id: &str, latency_ms: f64, throughput_mbps: f64) {
        let inner = self.inner();
        inner
            .slice_latency_ms
            .with_label_values(&[slice_id])
            .set(latency_ms);
        inner
            .slice_throughput_mbps
            .with_label_values(&[slice_id])
            .set(throughput_mbps);
    }

    pub fn inc_violation(&self, slice_id: &str, kind: &str) {
        self.inner()
            .qos_violations_total
            .with_label_values(&[slice_id, kind])
            .inc();
    }

    pub fn set_tunnel_state(&self, vni: u32, value: f64) {
        self.inner()
            .tunnel_state
            .with_label_values(&[&vni.to_string()])
            .set(value);
    }

    /// Drop per-slice series once a slice is retired
    pub fn forget_slice(&self, slice_id: &str) {
        let inner = self.inner();
        let _ = inner.slice_latency_ms.remove_label_values(&[slice_id]);
        let _ = inner.slice_throughput_mbps.remove_label_values(&[slice_id]);
    }

    pub fn observe_placement_latency(&self, duration_secs: f64) {
        self.inner().placement_latency_seconds.observe(duration_secs);
    }

    pub fn observe_provision_latency(&self, duration_secs: f64) {
        self.inner().provision_latency_seconds.observe(duration_secs);
    }

    pub fn inc_placement_failure(&self, reason: &str) {
        self.inner()
            .placement_failures_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn inc_rollbacks(&self) {
        self.inner().rollbacks_total.inc();
    }

    pub fn set_slices_active(&self, count: i64) {
        self.inner().slices_active.set(count);
    }

    pub fn set_vnis_allocated(&self, count: i64) {
        self.inner().vnis_allocated.set(count);
    }

    pub fn inc_command_errors(&self) {
        self.inner().command_errors_total.inc();
    }
}

/// Structured logger for slice lifecycle events
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    component: String,
}

impl StructuredLogger {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    /// Log a placement decision
    pub fn log_placement(&self, slice_id: &str, sites: &[String], score: f64, generation: u32) {
        info!(
            event = "slice_placed",
            component = %self.component,
            slice_id = %slice_id,
            sites = ?sites,
            score = score,
            generation = generation,
            "Placed slice"
        );
    }

    pub fn log_placement_rejected(&self, slice_id: &str, reason: &str) {
        warn!(
            event = "slice_placement_rejected",
            component = %self.component,
            slice_id = %slice_id,
            reason = %reason,
            "Placement rejected"
        );
    }

    /// Log a lifecycle transition
    pub fn log_transition(&self, slice_id: &str, from: &str, to: &str, event_name: &str) {
        info!(
            event = "slice_state_changed",
            component = %self.component,
            slice_id = %slice_id,
            from = %from,
            to = %to,
            trigger = %event_name,
            "Slice state changed"
        );
    }

    pub fn log_provisioned(&self, slice_id: &str, tunnels: usize, policies: usize, elapsed_ms: u128) {
        info!(
            event = "slice_provisioned",
            component = %self.component,
            slice_id = %slice_id,
            tunnels = tunnels,
            policies = policies,
            elapsed_ms = elapsed_ms,
            "Slice active"
        );
    }

    /// Log a QoS violation; the first few are info, later ones warn
    pub fn log_violation(&self, slice_id: &str, kind: &str, observed: f64, limit: f64, count: usize) {
        if count >= 2 {
            warn!(
                event = "qos_violation",
                component = %self.component,
                slice_id = %slice_id,
                kind = %kind,
                observed = observed,
                limit = limit,
                window_count = count,
                "Repeated QoS violation"
            );
        } else {
            info!(
                event = "qos_violation",
                component = %self.component,
                slice_id = %slice_id,
                kind = %kind,
                observed = observed,
                limit = limit,
                window_count = count,
                "QoS violation"
            );
        }
    }

    pub fn log_rollback(&self, slice_id: &str, reason: &str, compensations: usize, outcome: &str) {
        warn!(
            event = "slice_rolled_back",
            component = %self.component,
            slice_id = %slice_id,
            reason = %reason,
            compensations = compensations,
            outcome = %outcome,
            "Slice rolled back"
        );
    }

    pub fn log_tunnel(&self, vni: u32, slice_id: &str, state: &str) {
        info!(
            event = "tunnel_state_changed",
            component = %self.component,
            vni = vni,
            slice_id = %slice_id,
            state = %state,
            "Tunnel state changed"
        );
    }

    pub fn log_policy_applied(&self, slice_id: &str, node: &str, interface: &str, classes: usize) {
        info!(
            event = "policy_applied",
            component = %self.component,
            slice_id = %slice_id,
            node = %node,
            interface = %interface,
            classes = classes,
            "Shaping tree applied"
        );
    }

    pub fn log_startup(&self, version: &str, role: &str) {
        info!(
            event = "daemon_started",
            component = %self.component,
            version = %version,
            role = %role,
            "Slice QoS daemon started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "daemon_shutdown",
            component = %self.component,
            reason = %reason,
            "Slice QoS daemon shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_metrics_creation() {
        let metrics = SliceMetrics::new();
        metrics.record_measurement("slice-a", 4.2, 0.9);
        metrics.inc_violation("slice-a", "latency");
        metrics.set_tunnel_state(1000, 1.0);
        metrics.observe_placement_latency(0.002);
        metrics.inc_placement_failure("capacity_exhausted");
        metrics.forget_slice("slice-a");

        let families = prometheus::gather();
        assert!(families.iter().any(|f| f.get_name() == "qos_violations_total"));
        assert!(families.iter().any(|f| f.get_name() == "tunnel_state"));
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("orchestrator");
        assert_eq!(logger.component(), "orchestrator");
    }
}
