//! XMPP metrics for observability.
//!
//! Uses the global OpenTelemetry meter provider, which the host binary may
//! install. Without one, recording is a no-op.

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

static METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    METER.get_or_init(|| opentelemetry::global::meter("roost-xmpp"))
}

// ============================================================================
// Counters (Cumulative)
// ============================================================================

/// Counter for accepted TCP connections.
pub fn connections_accepted() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.connections.accepted")
        .with_description("Total client connections accepted")
        .with_unit("connection")
        .build()
}

/// Counter for XMPP stanzas processed.
pub fn stanzas_processed() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.stanzas.processed")
        .with_description("Total XMPP stanzas processed")
        .with_unit("stanza")
        .build()
}

/// Counter for authentication attempts.
pub fn auth_attempts() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.auth.attempts")
        .with_description("Total authentication attempts")
        .with_unit("attempt")
        .build()
}

/// Counter for stanzas dropped at a full or closed mailbox.
pub fn stanzas_dropped() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.stanzas.dropped")
        .with_description("Stanzas dropped before delivery")
        .with_unit("stanza")
        .build()
}

/// Counter for connection request outcomes.
pub fn connection_requests() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.connreq.outcomes")
        .with_description("Connection requests by outcome")
        .with_unit("request")
        .build()
}

// ============================================================================
// Gauges (Current State)
// ============================================================================

/// Gauge for bound sessions.
pub fn sessions_online() -> Gauge<i64> {
    meter()
        .i64_gauge("xmpp.sessions.online")
        .with_description("Current number of bound sessions")
        .with_unit("session")
        .build()
}

// ============================================================================
// Histograms (Latency)
// ============================================================================

/// Histogram for connection request round trips.
pub fn connection_request_latency() -> Histogram<f64> {
    meter()
        .f64_histogram("xmpp.connreq.latency")
        .with_description("Time from wake request to device answer")
        .with_unit("ms")
        .build()
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Record an accepted connection.
pub fn record_connection(transport: &'static str) {
    connections_accepted().add(1, &[KeyValue::new("transport", transport)]);
}

/// Record a stanza being processed.
pub fn record_stanza(stanza_type: &str, direction: &str) {
    stanzas_processed().add(
        1,
        &[
            KeyValue::new("type", stanza_type.to_string()),
            KeyValue::new("direction", direction.to_string()),
        ],
    );
}

/// Record an authentication attempt.
pub fn record_auth_attempt(mechanism: &str, success: bool) {
    auth_attempts().add(
        1,
        &[
            KeyValue::new("mechanism", mechanism.to_string()),
            KeyValue::new("result", if success { "success" } else { "failure" }),
        ],
    );
}

/// Record a dropped outbound stanza.
pub fn record_dropped(reason: &'static str) {
    stanzas_dropped().add(1, &[KeyValue::new("reason", reason)]);
}

/// Record the online session count.
pub fn record_session_count(count: i64) {
    sessions_online().record(count, &[]);
}

/// Record how a connection request ended.
pub fn record_connection_request(outcome: &str, latency_ms: Option<f64>) {
    connection_requests().add(1, &[KeyValue::new("outcome", outcome.to_string())]);
    if let Some(ms) = latency_ms {
        connection_request_latency().record(ms, &[KeyValue::new("outcome", outcome.to_string())]);
    }
}
