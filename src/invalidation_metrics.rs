//! Prometheus metrics for invalidation requests

use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, HistogramOpts, HistogramVec, Opts,
    Registry,
};
use std::sync::Arc;

const DURATION_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0];

/// Metrics for invalidation requests
#[derive(Clone)]
pub struct InvalidationMetrics {
    /// Invalidation requests by mode (template, ids, all)
    pub requests_total: Arc<CounterVec>,

    /// Invalidation requests by mode and result
    pub requests_by_result: Arc<CounterVec>,

    /// Fragments removed, by mode
    pub fragments_total: Arc<CounterVec>,

    pub duration_seconds: Arc<HistogramVec>,

    /// Rejected requests by reason (missing_token, invalid_token)
    pub auth_failures_total: Arc<CounterVec>,
}

impl InvalidationMetrics {
    /// Create metrics registered with the default prometheus registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let requests_total = register_counter_vec!(
            "fragment_cache_invalidation_requests_total",
            "Total number of invalidation requests",
            &["mode"]
        )?;
        let requests_by_result = register_counter_vec!(
            "fragment_cache_invalidation_requests_by_result",
            "Invalidation requests by result",
            &["mode", "result"]
        )?;
        let fragments_total = register_counter_vec!(
            "fragment_cache_invalidated_fragments_total",
            "Total number of fragments removed by invalidation requests",
            &["mode"]
        )?;
        let duration_seconds = register_histogram_vec!(
            "fragment_cache_invalidation_duration_seconds",
            "Duration of invalidation requests in seconds",
            &["mode"],
            DURATION_BUCKETS.to_vec()
        )?;
        let auth_failures_total = register_counter_vec!(
            "fragment_cache_invalidation_auth_failures_total",
            "Total number of rejected invalidation requests",
            &["reason"]
        )?;

        Ok(Self {
            requests_total: Arc::new(requests_total),
            requests_by_result: Arc::new(requests_by_result),
            fragments_total: Arc::new(fragments_total),
            duration_seconds: Arc::new(duration_seconds),
            auth_failures_total: Arc::new(auth_failures_total),
        })
    }

    /// Create metrics registered with a custom registry
    pub fn with_registry(registry: &Registry) -> Result<Self, prometheus::Error> {
        let requests_total = CounterVec::new(
            Opts::new(
                "fragment_cache_invalidation_requests_total",
                "Total number of invalidation requests",
            ),
            &["mode"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let requests_by_result = CounterVec::new(
            Opts::new(
                "fragment_cache_invalidation_requests_by_result",
                "Invalidation requests by result",
            ),
            &["mode", "result"],
        )?;
        registry.register(Box::new(requests_by_result.clone()))?;

        let fragments_total = CounterVec::new(
            Opts::new(
                "fragment_cache_invalidated_fragments_total",
                "Total number of fragments removed by invalidation requests",
            ),
            &["mode"],
        )?;
        registry.register(Box::new(fragments_total.clone()))?;

        let duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "fragment_cache_invalidation_duration_seconds",
                "Duration of invalidation requests in seconds",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["mode"],
        )?;
        registry.register(Box::new(duration_seconds.clone()))?;

        let auth_failures_total = CounterVec::new(
            Opts::new(
                "fragment_cache_invalidation_auth_failures_total",
                "Total number of rejected invalidation requests",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(auth_failures_total.clone()))?;

        Ok(Self {
            requests_total: Arc::new(requests_total),
            requests_by_result: Arc::new(requests_by_result),
            fragments_total: Arc::new(fragments_total),
            duration_seconds: Arc::new(duration_seconds),
            auth_failures_total: Arc::new(auth_failures_total),
        })
    }

    pub fn record_request(&self, mode: &str) {
        self.requests_total.with_label_values(&[mode]).inc();
    }

    pub fn record_result(&self, mode: &str, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.requests_by_result
            .with_label_values(&[mode, result])
            .inc();
    }

    pub fn record_fragments(&self, mode: &str, count: usize) {
        self.fragments_total
            .with_label_values(&[mode])
            .inc_by(count as f64);
    }

    pub fn record_duration(&self, mode: &str, duration_secs: f64) {
        self.duration_seconds
            .with_label_values(&[mode])
            .observe(duration_secs);
    }

    pub fn record_auth_failure(&self, reason: &str) {
        self.auth_failures_total.with_label_values(&[reason]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_custom_registry_collects_metrics() {
        let registry = Registry::new();
        let metrics = InvalidationMetrics::with_registry(&registry).unwrap();

        metrics.record_request("ids");
        metrics.record_result("ids", true);
        metrics.record_fragments("ids", 3);
        metrics.record_duration("ids", 0.002);
        metrics.record_auth_failure("invalid_token");

        assert_eq!(metrics.requests_total.with_label_values(&["ids"]).get(), 1.0);
        assert_eq!(metrics.fragments_total.with_label_values(&["ids"]).get(), 3.0);
        let families = registry.gather();
        assert_eq!(families.len(), 5);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = Registry::new();
        InvalidationMetrics::with_registry(&registry).unwrap();
        assert!(InvalidationMetrics::with_registry(&registry).is_err());
    }
}
