//! Prometheus metrics for the watch pipeline.

use prometheus::{IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

/// Counters and gauges shared by every watch loop and the notifier.
///
/// Cloning is cheap; all clones update the same registry.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Events handed to the dispatcher, by cluster and kind
    pub events_emitted: IntCounterVec,
    /// Delivery outcomes: `delivered`, `rejected`, `exhausted`
    pub deliveries: IntCounterVec,
    /// Delivery attempts beyond the first
    pub delivery_retries: IntCounter,
    /// Full relists triggered by an expired resourceVersion
    pub resyncs: IntCounterVec,
    /// Watch streams reopened after a close or transport error
    pub watch_restarts: IntCounterVec,
    /// Notifications skipped because they failed validation
    pub malformed: IntCounterVec,
    /// Pods in the previous-state cache
    pub cache_entries: IntGaugeVec,
}

impl Metrics {
    /// Creates and registers every metric on a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("pod_watcher".to_string()), None)?;

        let events_emitted = IntCounterVec::new(
            Opts::new("events_emitted_total", "Phase transition events dispatched"),
            &["cluster", "kind"],
        )?;
        let deliveries = IntCounterVec::new(
            Opts::new("deliveries_total", "Event deliveries to clusterapi by outcome"),
            &["outcome"],
        )?;
        let delivery_retries = IntCounter::new("delivery_retries_total", "Delivery attempts beyond the first")?;
        let resyncs = IntCounterVec::new(
            Opts::new("resyncs_total", "Full relists after resourceVersion expiry"),
            &["cluster"],
        )?;
        let watch_restarts = IntCounterVec::new(
            Opts::new("watch_restarts_total", "Watch streams reopened"),
            &["cluster"],
        )?;
        let malformed = IntCounterVec::new(
            Opts::new("malformed_notifications_total", "Notifications rejected by validation"),
            &["cluster"],
        )?;
        let cache_entries = IntGaugeVec::new(
            Opts::new("cache_entries", "Pods tracked in the previous-state cache"),
            &["cluster"],
        )?;

        registry.register(Box::new(events_emitted.clone()))?;
        registry.register(Box::new(deliveries.clone()))?;
        registry.register(Box::new(delivery_retries.clone()))?;
        registry.register(Box::new(resyncs.clone()))?;
        registry.register(Box::new(watch_restarts.clone()))?;
        registry.register(Box::new(malformed.clone()))?;
        registry.register(Box::new(cache_entries.clone()))?;

        Ok(Self {
            registry,
            events_emitted,
            deliveries,
            delivery_retries,
            resyncs,
            watch_restarts,
            malformed,
            cache_entries,
        })
    }

    /// Renders the registry in the Prometheus text format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_prefixed_metrics() {
        let metrics = Metrics::new().expect("metrics");
        metrics.events_emitted.with_label_values(&["default", "ADDED"]).inc();
        metrics.deliveries.with_label_values(&["delivered"]).inc_by(2);

        let text = metrics.render().expect("render");

        assert!(text.contains("pod_watcher_events_emitted_total{cluster=\"default\",kind=\"ADDED\"} 1"));
        assert!(text.contains("pod_watcher_deliveries_total{outcome=\"delivered\"} 2"));
    }
}
