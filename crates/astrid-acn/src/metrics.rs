//! Routing and service metrics.
//!
//! Latency histograms are recorded in microseconds with buckets spanning
//! 100 µs to 1 s, which brackets everything from a local table hit to a
//! full DHT traversal.

use std::sync::Arc;

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder,
};
use tokio::time::Instant;

const LATENCY_BUCKETS_US: &[f64] = &[
    100.0, 500.0, 1_000.0, 10_000.0, 100_000.0, 500_000.0, 1_000_000.0,
];

pub struct Metrics {
    registry: Registry,

    pub route_attempts: IntCounter,
    pub route_successes: IntCounter,
    pub delegate_registrations: IntCounter,
    pub relay_registrations: IntCounter,

    pub active_delegates: IntGauge,
    pub active_relays: IntGauge,
    pub inflight_routes: IntGauge,

    pub dht_store_us: Histogram,
    pub dht_lookup_us: Histogram,
    pub register_us: Histogram,
    pub route_us: Histogram,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| {
            let c = IntCounter::new(name, help).expect("valid metric opts");
            registry.register(Box::new(c.clone())).expect("unique metric");
            c
        };
        let gauge = |name: &str, help: &str| {
            let g = IntGauge::new(name, help).expect("valid metric opts");
            registry.register(Box::new(g.clone())).expect("unique metric");
            g
        };
        let histogram = |name: &str, help: &str| {
            let h = Histogram::with_opts(
                HistogramOpts::new(name, help).buckets(LATENCY_BUCKETS_US.to_vec()),
            )
            .expect("valid metric opts");
            registry.register(Box::new(h.clone())).expect("unique metric");
            h
        };

        Arc::new(Self {
            route_attempts: counter("acn_route_attempts_total", "Envelope route attempts"),
            route_successes: counter("acn_route_successes_total", "Envelope routes delivered"),
            delegate_registrations: counter(
                "acn_delegate_registrations_total",
                "Delegate client registrations, all-time",
            ),
            relay_registrations: counter(
                "acn_relay_registrations_total",
                "Relay client registrations, all-time",
            ),
            active_delegates: gauge(
                "acn_active_delegate_connections",
                "Currently connected delegate clients",
            ),
            active_relays: gauge("acn_active_relay_clients", "Currently registered relay clients"),
            inflight_routes: gauge("acn_inflight_routes", "Routes currently in flight"),
            dht_store_us: histogram(
                "acn_dht_store_latency_us",
                "DHT provider announcement latency (µs)",
            ),
            dht_lookup_us: histogram("acn_dht_lookup_latency_us", "DHT lookup latency (µs)"),
            register_us: histogram(
                "acn_register_latency_us",
                "End-to-end client registration latency (µs)",
            ),
            route_us: histogram("acn_route_latency_us", "End-to-end route latency (µs)"),
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record the elapsed time since `started` in `histogram`.
    pub fn observe_since(histogram: &Histogram, started: Instant) {
        histogram.observe(started.elapsed().as_micros() as f64);
    }

    /// Render all metrics in the Prometheus text exposition format.
    pub fn export(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::warn!("metrics encoding failed: {e}");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_and_gauges_track() {
        let metrics = Metrics::new();
        metrics.route_attempts.inc();
        metrics.route_attempts.inc();
        metrics.route_successes.inc();
        metrics.active_relays.inc();
        metrics.active_relays.dec();

        assert_eq!(metrics.route_attempts.get(), 2);
        assert_eq!(metrics.route_successes.get(), 1);
        assert_eq!(metrics.active_relays.get(), 0);
    }

    #[test]
    fn histograms_capture_samples() {
        let metrics = Metrics::new();
        metrics.dht_lookup_us.observe(250.0);
        metrics.dht_lookup_us.observe(2_000.0);
        assert_eq!(metrics.dht_lookup_us.get_sample_count(), 2);

        let text = metrics.export();
        assert!(text.contains("acn_dht_lookup_latency_us"));
        assert!(text.contains("acn_route_attempts_total"));
    }
}
