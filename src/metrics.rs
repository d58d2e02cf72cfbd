//! Prometheus metrics (spec §4.I, §6.4). Wiring the `/metrics` HTTP endpoint
//! is an external collaborator's job (spec §1); this module only registers
//! the series and exposes [`Metrics::gather`] for that adapter to call.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

use crate::model::FailoverReason;

pub struct Metrics {
    registry: Registry,

    reconciliations_total: IntCounterVec,
    reconciliation_errors_total: IntCounterVec,
    failover_count_total: IntCounterVec,
    sticky_leader_hits_total: IntCounterVec,
    sticky_leader_misses_total: IntCounterVec,
    port_resolution_failures_total: IntCounterVec,
    endpoint_write_errors_total: IntCounterVec,
    cache_hits_total: IntCounterVec,
    cache_misses_total: IntCounterVec,
    timeout_occurrences_total: IntCounterVec,
    retry_attempts_total: IntCounterVec,
    retry_success_after_retry_total: IntCounterVec,

    pods_available: IntGaugeVec,
    leader_duration_seconds: prometheus::GaugeVec,
    leader_pod_age_seconds: prometheus::GaugeVec,
    leader_stable: IntGaugeVec,
    leader_service_without_endpoints: IntGaugeVec,
    leader_services_total: IntGauge,
    endpointslices_total: IntGauge,
    cache_size: IntGaugeVec,

    reconciliation_duration_seconds: HistogramVec,
    failover_latency_seconds: HistogramVec,
    cache_update_duration_seconds: HistogramVec,
    api_call_duration_seconds: HistogramVec,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        macro_rules! counter_vec {
            ($name:expr, $help:expr, $labels:expr) => {{
                let c = IntCounterVec::new(Opts::new($name, $help), $labels)?;
                registry.register(Box::new(c.clone()))?;
                c
            }};
        }
        macro_rules! gauge_vec {
            ($name:expr, $help:expr, $labels:expr) => {{
                let g = IntGaugeVec::new(Opts::new($name, $help), $labels)?;
                registry.register(Box::new(g.clone()))?;
                g
            }};
        }
        macro_rules! fgauge_vec {
            ($name:expr, $help:expr, $labels:expr) => {{
                let g = prometheus::GaugeVec::new(Opts::new($name, $help), $labels)?;
                registry.register(Box::new(g.clone()))?;
                g
            }};
        }
        macro_rules! histogram_vec {
            ($name:expr, $help:expr, $labels:expr) => {{
                let h = HistogramVec::new(HistogramOpts::new($name, $help), $labels)?;
                registry.register(Box::new(h.clone()))?;
                h
            }};
        }

        let reconciliations_total = counter_vec!(
            "zen_lead_reconciliations_total",
            "Reconciliations by result",
            &["namespace", "service", "result"]
        );
        let reconciliation_errors_total = counter_vec!(
            "zen_lead_reconciliation_errors_total",
            "Reconciliation errors by error_type",
            &["namespace", "service", "error_type"]
        );
        let failover_count_total = counter_vec!(
            "zen_lead_failover_count_total",
            "Leader failovers by reason",
            &["namespace", "service", "reason"]
        );
        let sticky_leader_hits_total = counter_vec!(
            "zen_lead_sticky_leader_hits_total",
            "Times the previous leader was retained",
            &[] as &[&str]
        );
        let sticky_leader_misses_total = counter_vec!(
            "zen_lead_sticky_leader_misses_total",
            "Times the deterministic fallback chose a new leader",
            &[] as &[&str]
        );
        let port_resolution_failures_total = counter_vec!(
            "zen_lead_port_resolution_failures_total",
            "Unresolved named target ports",
            &["namespace", "service", "port_name"]
        );
        let endpoint_write_errors_total = counter_vec!(
            "zen_lead_endpoint_write_errors_total",
            "EndpointSlice write failures",
            &[] as &[&str]
        );
        let cache_hits_total = counter_vec!(
            "zen_lead_cache_hits_total",
            "Opt-In Index / Leader-Pod Cache hits",
            &["namespace"]
        );
        let cache_misses_total = counter_vec!(
            "zen_lead_cache_misses_total",
            "Opt-In Index / Leader-Pod Cache misses",
            &["namespace"]
        );
        let timeout_occurrences_total = counter_vec!(
            "zen_lead_timeout_occurrences_total",
            "Scoped-deadline timeouts by operation",
            &["namespace", "operation"]
        );
        let retry_attempts_total = counter_vec!(
            "zen_lead_retry_attempts_total",
            "Retry wrapper attempts",
            &["namespace", "service", "operation", "attempt"]
        );
        let retry_success_after_retry_total = counter_vec!(
            "zen_lead_retry_success_after_retry_total",
            "Operations that only succeeded after at least one retry",
            &[] as &[&str]
        );

        let pods_available = gauge_vec!(
            "zen_lead_pods_available",
            "Eligible pods observed at selection time",
            &["namespace", "service"]
        );
        let leader_duration_seconds = fgauge_vec!(
            "zen_lead_leader_duration_seconds",
            "Time the current leader has held the role",
            &["namespace", "service"]
        );
        let leader_pod_age_seconds = fgauge_vec!(
            "zen_lead_leader_pod_age_seconds",
            "Age of the current leader pod",
            &["namespace", "service"]
        );
        let leader_stable = gauge_vec!(
            "zen_lead_leader_stable",
            "1 if the service currently has a leader, else 0",
            &["namespace", "service"]
        );
        let leader_service_without_endpoints = gauge_vec!(
            "zen_lead_leader_service_without_endpoints",
            "1 if the leader Service's EndpointSlice is currently empty",
            &["namespace", "service"]
        );
        let leader_services_total = IntGauge::new(
            "zen_lead_leader_services_total",
            "Total managed leader Services",
        )?;
        registry.register(Box::new(leader_services_total.clone()))?;
        let endpointslices_total = IntGauge::new(
            "zen_lead_endpointslices_total",
            "Total managed EndpointSlices",
        )?;
        registry.register(Box::new(endpointslices_total.clone()))?;
        let cache_size = gauge_vec!(
            "zen_lead_cache_size",
            "Opt-In Index entries per namespace",
            &["namespace"]
        );

        let reconciliation_duration_seconds = histogram_vec!(
            "zen_lead_reconciliation_duration_seconds",
            "Reconcile call latency",
            &["namespace", "service", "result"]
        );
        let failover_latency_seconds = histogram_vec!(
            "zen_lead_failover_latency_seconds",
            "Time from trigger signal to EndpointSlice update",
            &["namespace", "service", "reason"]
        );
        let cache_update_duration_seconds = histogram_vec!(
            "zen_lead_cache_update_duration_seconds",
            "Opt-In Index refresh latency",
            &["namespace"]
        );
        let api_call_duration_seconds = histogram_vec!(
            "zen_lead_api_call_duration_seconds",
            "Kubernetes API call latency",
            &["operation", "result"]
        );

        Ok(Self {
            registry,
            reconciliations_total,
            reconciliation_errors_total,
            failover_count_total,
            sticky_leader_hits_total,
            sticky_leader_misses_total,
            port_resolution_failures_total,
            endpoint_write_errors_total,
            cache_hits_total,
            cache_misses_total,
            timeout_occurrences_total,
            retry_attempts_total,
            retry_success_after_retry_total,
            pods_available,
            leader_duration_seconds,
            leader_pod_age_seconds,
            leader_stable,
            leader_service_without_endpoints,
            leader_services_total,
            endpointslices_total,
            cache_size,
            reconciliation_duration_seconds,
            failover_latency_seconds,
            cache_update_duration_seconds,
            api_call_duration_seconds,
        })
    }

    pub fn gather(&self) -> String {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&families, &mut buffer)
            .unwrap_or(());
        String::from_utf8(buffer).unwrap_or_default()
    }

    pub fn record_reconcile(&self, namespace: &str, service: &str, result: &str, seconds: f64) {
        self.reconciliations_total
            .with_label_values(&[namespace, service, result])
            .inc();
        self.reconciliation_duration_seconds
            .with_label_values(&[namespace, service, result])
            .observe(seconds);
    }

    pub fn record_reconcile_error(&self, namespace: &str, service: &str, error_type: &str) {
        self.reconciliation_errors_total
            .with_label_values(&[namespace, service, error_type])
            .inc();
    }

    pub fn record_failover(
        &self,
        namespace: &str,
        service: &str,
        reason: FailoverReason,
        latency_seconds: f64,
    ) {
        self.failover_count_total
            .with_label_values(&[namespace, service, reason.as_str()])
            .inc();
        self.failover_latency_seconds
            .with_label_values(&[namespace, service, reason.as_str()])
            .observe(latency_seconds);
    }

    pub fn sticky_hit(&self) {
        self.sticky_leader_hits_total.with_label_values(&[]).inc();
    }

    pub fn sticky_miss(&self) {
        self.sticky_leader_misses_total.with_label_values(&[]).inc();
    }

    pub fn port_resolution_failure(&self, namespace: &str, service: &str, port_name: &str) {
        self.port_resolution_failures_total
            .with_label_values(&[namespace, service, port_name])
            .inc();
    }

    pub fn endpoint_write_error(&self) {
        self.endpoint_write_errors_total.with_label_values(&[]).inc();
    }

    pub fn cache_hit(&self, namespace: &str) {
        self.cache_hits_total.with_label_values(&[namespace]).inc();
    }

    pub fn cache_miss(&self, namespace: &str) {
        self.cache_misses_total.with_label_values(&[namespace]).inc();
    }

    pub fn timeout(&self, namespace: &str, operation: &str) {
        self.timeout_occurrences_total
            .with_label_values(&[namespace, operation])
            .inc();
    }

    pub fn retry_attempt(&self, namespace: &str, service: &str, operation: &str, attempt: u32) {
        self.retry_attempts_total
            .with_label_values(&[namespace, service, operation, &attempt.to_string()])
            .inc();
    }

    pub fn retry_success_after_retry(&self) {
        self.retry_success_after_retry_total
            .with_label_values(&[])
            .inc();
    }

    pub fn set_pods_available(&self, namespace: &str, service: &str, count: i64) {
        self.pods_available
            .with_label_values(&[namespace, service])
            .set(count);
    }

    pub fn set_leader_gauges(
        &self,
        namespace: &str,
        service: &str,
        has_leader: bool,
        leader_duration_seconds: f64,
        leader_pod_age_seconds: f64,
    ) {
        self.leader_stable
            .with_label_values(&[namespace, service])
            .set(if has_leader { 1 } else { 0 });
        self.leader_duration_seconds
            .with_label_values(&[namespace, service])
            .set(if has_leader { leader_duration_seconds } else { 0.0 });
        self.leader_pod_age_seconds
            .with_label_values(&[namespace, service])
            .set(if has_leader { leader_pod_age_seconds } else { 0.0 });
    }

    pub fn set_endpoints_empty(&self, namespace: &str, service: &str, empty: bool) {
        self.leader_service_without_endpoints
            .with_label_values(&[namespace, service])
            .set(if empty { 1 } else { 0 });
    }

    pub fn set_cache_size(&self, namespace: &str, size: i64) {
        self.cache_size.with_label_values(&[namespace]).set(size);
    }

    pub fn set_leader_services_total(&self, count: i64) {
        self.leader_services_total.set(count);
    }

    pub fn set_endpointslices_total(&self, count: i64) {
        self.endpointslices_total.set(count);
    }

    pub fn observe_api_call(&self, operation: &str, result: &str, seconds: f64) {
        self.api_call_duration_seconds
            .with_label_values(&[operation, result])
            .observe(seconds);
    }

    pub fn observe_cache_update(&self, namespace: &str, seconds: f64) {
        self.cache_update_duration_seconds
            .with_label_values(&[namespace])
            .observe(seconds);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_without_duplicate_metric_error() {
        let metrics = Metrics::new().unwrap();
        metrics.record_reconcile("ns", "svc", "success", 0.01);
        metrics.sticky_hit();
        let text = metrics.gather();
        assert!(text.contains("zen_lead_reconciliations_total"));
        assert!(text.contains("zen_lead_sticky_leader_hits_total"));
    }
}
