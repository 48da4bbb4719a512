//! Routing Metrics
//!
//! Prometheus metrics for the data path and the snapshot publisher.

use lazy_static::lazy_static;
use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    /// Global metrics registry
    pub static ref METRICS_REGISTRY: Registry = Registry::new();

    /// Routed requests by matched host, outcome and returned status
    ///
    /// Note: Fallback metrics use .expect() as last line of defense - if Prometheus itself is broken, we should panic
    #[allow(clippy::expect_used)]
    pub static ref ROUTED_REQUESTS_TOTAL: IntCounterVec = {
        let labels = &["host", "outcome", "status"];
        let counter = IntCounterVec::new(
            Opts::new("kgroute_requests_total", "Total number of routed requests"),
            labels,
        )
        .unwrap_or_else(|e| {
            eprintln!("WARN: Failed to create kgroute_requests_total counter: {}", e);
            IntCounterVec::new(
                Opts::new("kgroute_requests_total_fallback", "Fallback metric for routed requests"),
                labels,
            )
            .expect("Fallback metric creation should never fail - if this panics, Prometheus is broken")
        });
        register(counter, "kgroute_requests_total")
    };

    /// Request latency by outcome (in seconds)
    #[allow(clippy::expect_used)]
    pub static ref REQUEST_DURATION: HistogramVec = {
        let buckets = vec![
            0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000,
        ];
        let histogram = HistogramVec::new(
            HistogramOpts::new(
                "kgroute_request_duration_seconds",
                "Routed request latencies in seconds",
            )
            .buckets(buckets),
            &["outcome"],
        )
        .unwrap_or_else(|e| {
            eprintln!("WARN: Failed to create kgroute_request_duration_seconds histogram: {}", e);
            HistogramVec::new(
                HistogramOpts::new(
                    "kgroute_request_duration_seconds_fallback",
                    "Fallback metric for request duration",
                ),
                &["outcome"],
            )
            .expect("Fallback metric creation should never fail - if this panics, Prometheus is broken")
        });
        register(histogram, "kgroute_request_duration_seconds")
    };

    /// Generation of the currently published topology snapshot
    #[allow(clippy::expect_used)]
    pub static ref SNAPSHOT_GENERATION: IntGauge = {
        let gauge = IntGauge::new(
            "kgroute_snapshot_generation",
            "Generation of the published topology snapshot",
        )
        .expect("Gauge with static name and help should never fail");
        register(gauge, "kgroute_snapshot_generation")
    };

    /// Ready members per Service in the published snapshot
    #[allow(clippy::expect_used)]
    pub static ref READY_MEMBERS: IntGaugeVec = {
        let gauge = IntGaugeVec::new(
            Opts::new("kgroute_service_ready_members", "Ready instances selected by each Service"),
            &["service"],
        )
        .expect("Gauge with static name and help should never fail");
        register(gauge, "kgroute_service_ready_members")
    };

    /// Readiness transitions driven by active health checks
    #[allow(clippy::expect_used)]
    pub static ref HEALTH_TRANSITIONS_TOTAL: IntCounterVec = {
        let counter = IntCounterVec::new(
            Opts::new(
                "kgroute_health_transitions_total",
                "Instance readiness transitions caused by health checks",
            ),
            &["instance", "to"],
        )
        .expect("Counter with static name and help should never fail");
        register(counter, "kgroute_health_transitions_total")
    };
}

fn register<C: Collector + Clone + 'static>(collector: C, name: &str) -> C {
    if let Err(e) = METRICS_REGISTRY.register(Box::new(collector.clone())) {
        eprintln!("WARN: Failed to register {}: {}", name, e);
        eprintln!("WARN: Metrics collection will be degraded but routing will continue");
    }
    collector
}

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<Vec<u8>, String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();

    let metric_families = METRICS_REGISTRY.gather();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    Ok(buffer)
}

/// Get the Prometheus text encoder format type
pub fn metrics_content_type() -> &'static str {
    "text/plain; version=0.0.4; charset=utf-8"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoded_metrics_include_routed_requests() {
        ROUTED_REQUESTS_TOTAL
            .with_label_values(&["knowledgegraph.example.com", "success", "200"])
            .inc();
        SNAPSHOT_GENERATION.set(SNAPSHOT_GENERATION.get().max(1));

        let encoded = encode_metrics().expect("Should encode metrics");
        let text = String::from_utf8(encoded).expect("Metrics should be UTF-8");

        assert!(text.contains("kgroute_requests_total"));
        assert!(text.contains("kgroute_snapshot_generation"));
    }
}
