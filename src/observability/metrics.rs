//! Metrics collection and exposition.
//!
//! # Metrics
//! - `control_plane_probes_total` (counter): probes by service, status
//! - `control_plane_probe_duration_seconds` (histogram): probe latency
//! - `control_plane_service_health` (gauge): 0=unknown 1=healthy 2=degraded 3=unhealthy
//! - `control_plane_routed_total` (counter): routed requests by service, backend, outcome
//! - `control_plane_route_duration_seconds` (histogram): end-to-end routing latency
//! - `control_plane_rejected_total` (counter): requests shed by the in-flight bound
//! - `control_plane_circuit_state` (gauge): 0=closed 1=open 2=half_open
//! - `control_plane_cache_events_total` (counter): hit, miss, store, invalidate, error
//! - `control_plane_recovery_total` (counter): recovery outcomes by service

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::health::HealthStatus;
use crate::resilience::CircuitState;

/// Start the Prometheus scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_probe(service: &str, status: HealthStatus, latency: Duration) {
    counter!(
        "control_plane_probes_total",
        "service" => service.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("control_plane_probe_duration_seconds", "service" => service.to_string())
        .record(latency.as_secs_f64());
}

pub fn record_service_health(service: &str, status: HealthStatus) {
    gauge!("control_plane_service_health", "service" => service.to_string()).set(status as u8 as f64);
}

pub fn record_routed(service: &str, backend: &str, outcome: &'static str, start: Instant) {
    counter!(
        "control_plane_routed_total",
        "service" => service.to_string(),
        "backend" => backend.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    histogram!("control_plane_route_duration_seconds", "service" => service.to_string())
        .record(start.elapsed().as_secs_f64());
}

pub fn record_rejected(service: &str) {
    counter!("control_plane_rejected_total", "service" => service.to_string()).increment(1);
}

pub fn record_circuit_transition(backend: &str, state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::Open => 1.0,
        CircuitState::HalfOpen => 2.0,
    };
    gauge!("control_plane_circuit_state", "backend" => backend.to_string()).set(value);
}

pub fn record_cache(event: &'static str) {
    counter!("control_plane_cache_events_total", "event" => event).increment(1);
}

pub fn record_recovery(service: &str, outcome: &'static str) {
    counter!(
        "control_plane_recovery_total",
        "service" => service.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}
