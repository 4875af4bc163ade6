//! Prometheus metrics for build observability.

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};

/// Install the Prometheus recorder, with a scrape listener when an address is given.
pub fn init_metrics(listen: Option<SocketAddr>) {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    let result = match listen {
        Some(addr) => builder.with_http_listener(addr).install(),
        None => builder.install_recorder().map(|_| ()),
    };
    if let Err(e) = result {
        tracing::warn!("Failed to install Prometheus exporter: {}", e);
    }
}

/// Record a webhook received event.
pub fn webhook_received(event_type: &str) {
    counter!("peon_webhooks_received_total", "event" => event_type.to_string()).increment(1);
}

/// Record a build reaching a status.
pub fn build_status_changed(status: &str) {
    counter!("peon_builds_total", "status" => status.to_string()).increment(1);
}

/// Record build duration.
pub fn build_duration(duration_secs: f64) {
    histogram!("peon_build_duration_seconds").record(duration_secs);
}

/// Record step duration.
pub fn step_duration(step: &str, duration_secs: f64) {
    histogram!("peon_step_duration_seconds", "step" => step.to_string()).record(duration_secs);
}

pub fn build_started() {
    gauge!("peon_builds_running").increment(1.0);
}

pub fn build_ended() {
    gauge!("peon_builds_running").decrement(1.0);
}

pub fn cache_restored(count: usize) {
    counter!("peon_cache_restored_total").increment(count as u64);
}

pub fn cache_saved(count: usize) {
    counter!("peon_cache_saved_total").increment(count as u64);
}

pub fn cache_pruned(count: usize) {
    counter!("peon_cache_pruned_total").increment(count as u64);
}

pub fn render_completed() {
    counter!("peon_renders_total").increment(1);
}
