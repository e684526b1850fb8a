//! Metrics collection and exposition.
//!
//! # Metrics
//! - `capture_entries_total` (counter): transactions completed by the proxy
//! - `archive_entries_written_total` (counter): entries serialized
//! - `archive_entries_discarded_total` (counter): entries submitted outside `Running`
//! - `replay_requests_total` (counter): replayed requests by outcome
//! - `replay_request_duration_seconds` (histogram): send to response body read
//! - `replay_skew_warnings_total` (counter): fires outside the skew threshold
//! - `replay_active_connections` (gauge): in-flight replay exchanges
//! - `session_contexts` (gauge): live session contexts
//! - `session_rekeys_total` (counter): contexts moved or merged to a rotated identity
//! - `session_gate_wait_seconds` (histogram): time blocking requests waited for their gate
//!
//! Without an installed recorder every call is a no-op.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape listener on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => {
            describe();
            tracing::info!(address = %addr, "Metrics endpoint listening");
        }
        Err(e) => tracing::error!(error = %e, address = %addr, "Failed to install metrics exporter"),
    }
}

fn describe() {
    describe_counter!("capture_entries_total", "Transactions captured into archive entries");
    describe_counter!("archive_entries_written_total", "Entries written to the archive");
    describe_counter!("archive_entries_discarded_total", "Entries discarded because the writer was not running");
    describe_counter!("replay_requests_total", "Replayed requests by outcome");
    describe_histogram!("replay_request_duration_seconds", "Replay exchange duration");
    describe_counter!("replay_skew_warnings_total", "Replay fires outside the skew threshold");
    describe_gauge!("replay_active_connections", "In-flight replay exchanges");
    describe_gauge!("session_contexts", "Live session contexts");
    describe_counter!("session_rekeys_total", "Session contexts re-keyed after identity rotation");
    describe_histogram!("session_gate_wait_seconds", "Wait for a session gate before sending");
}

pub fn record_capture(body_kind: &'static str) {
    counter!("capture_entries_total", "body" => body_kind).increment(1);
}

pub fn record_entry_written() {
    counter!("archive_entries_written_total").increment(1);
}

pub fn record_entry_discarded() {
    counter!("archive_entries_discarded_total").increment(1);
}

pub fn record_replay(outcome: &'static str, start: Instant) {
    counter!("replay_requests_total", "outcome" => outcome).increment(1);
    histogram!("replay_request_duration_seconds").record(start.elapsed().as_secs_f64());
}

pub fn record_skew(direction: &'static str) {
    counter!("replay_skew_warnings_total", "direction" => direction).increment(1);
}

pub fn set_active_connections(count: u64) {
    gauge!("replay_active_connections").set(count as f64);
}

pub fn set_session_contexts(count: usize) {
    gauge!("session_contexts").set(count as f64);
}

pub fn record_rekey(kind: &'static str) {
    counter!("session_rekeys_total", "kind" => kind).increment(1);
}

pub fn record_gate_wait(start: Instant) {
    histogram!("session_gate_wait_seconds").record(start.elapsed().as_secs_f64());
}
