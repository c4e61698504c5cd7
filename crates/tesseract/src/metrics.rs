// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Metrics for the HTTP submission surface. The sequencing pipeline
//! registers its own metrics against the same registry, so `/metrics`
//! exposes both.

use prometheus::{
    register_gauge_with_registry, register_histogram_vec_with_registry,
    register_int_counter_vec_with_registry, Gauge, HistogramVec, IntCounterVec, Registry,
    TextEncoder,
};

#[derive(Clone)]
pub struct HttpMetrics {
    registry: Registry,

    /// Requests served, by endpoint and status code.
    pub req_count: IntCounterVec,
    /// Request latencies in seconds, by endpoint.
    pub req_duration: HistogramVec,
    /// Requests currently being served.
    pub req_in_flight: Gauge,
}

impl HttpMetrics {
    /// Registers the HTTP metrics with the given registry.
    ///
    /// # Panics
    ///
    /// Panics if metrics with these names are already registered.
    pub fn new(registry: &Registry) -> Self {
        let req_count = register_int_counter_vec_with_registry!(
            "http_requests_total",
            "Requests served, by endpoint and status.",
            &["endpoint", "status"],
            registry
        )
        .unwrap();
        let req_duration = register_histogram_vec_with_registry!(
            "http_request_duration_seconds",
            "Request serving latencies in seconds, by endpoint.",
            &["endpoint"],
            vec![0.05, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            registry
        )
        .unwrap();
        let req_in_flight = register_gauge_with_registry!(
            "http_in_flight_requests",
            "Requests currently being served.",
            registry
        )
        .unwrap();
        Self {
            registry: registry.clone(),
            req_count,
            req_duration,
            req_in_flight,
        }
    }

    /// Renders every metric in the registry in the Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        let encoder = TextEncoder::new();
        encoder
            .encode_utf8(&self.registry.gather(), &mut buffer)
            .unwrap_or_default();
        buffer
    }
}
