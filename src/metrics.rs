// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Outbound envelope posts
//! - Transport retries
//! - Event stream connections
//! - Apply loop outcomes
//! - Deduplication state
//!
//! No exporter is installed here; the host process picks one.
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration)
//!
//! # Usage
//!
//! ```rust,no_run
//! use event_replication::metrics;
//! use std::time::Duration;
//!
//! // In the apply loop after upserting
//! metrics::record_event_applied("worklog", "created");
//!
//! // After posting an envelope
//! metrics::record_envelope_posted("worklog", "created", 201, Duration::from_millis(12));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Transport
// ═══════════════════════════════════════════════════════════════════════════════

/// Record a retried attempt. `cause` is `"status"` or `"error"`.
pub fn record_transport_retry(method: &str, cause: &str) {
    counter!("replication_transport_retries_total", "method" => method.to_string(), "cause" => cause.to_string()).increment(1);
}

/// Record a request that ran out of retries.
pub fn record_transport_exhausted(method: &str) {
    counter!("replication_transport_exhausted_total", "method" => method.to_string()).increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════════
// Broadcast (write path)
// ═══════════════════════════════════════════════════════════════════════════════

/// Record an envelope POST that received a response.
pub fn record_envelope_posted(topic: &str, kind: &str, status: u16, duration: Duration) {
    let outcome = if status == 201 { "success" } else { "rejected" };
    counter!(
        "replication_envelopes_posted_total",
        "topic" => topic.to_string(),
        "kind" => kind.to_string(),
        "status" => status.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    histogram!("replication_post_event_duration_seconds", "topic" => topic.to_string())
        .record(duration.as_secs_f64());
}

/// Record an envelope POST that failed without a response.
pub fn record_envelope_post_error(topic: &str, kind: &str) {
    counter!(
        "replication_envelopes_posted_total",
        "topic" => topic.to_string(),
        "kind" => kind.to_string(),
        "status" => "none",
        "outcome" => "error"
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════════
// Event stream
// ═══════════════════════════════════════════════════════════════════════════════

/// Record a connect attempt. `outcome` is `"connected"`, `"status"` or `"error"`.
pub fn record_stream_connection(topic: &str, outcome: &str) {
    counter!("replication_stream_connections_total", "topic" => topic.to_string(), "outcome" => outcome.to_string()).increment(1);
}

/// Record the end of a streaming session.
pub fn record_stream_disconnect(topic: &str, reason: &str) {
    counter!("replication_stream_disconnects_total", "topic" => topic.to_string(), "reason" => reason.to_string()).increment(1);
}

/// Record a `data:` line forwarded to the apply loop.
pub fn record_stream_data_line(topic: &str) {
    counter!("replication_stream_data_lines_total", "topic" => topic.to_string()).increment(1);
}

pub fn record_stream_unrecognized_line(topic: &str) {
    counter!("replication_stream_unrecognized_lines_total", "topic" => topic.to_string()).increment(1);
}

/// Whether the resume cursor holds an id.
pub fn set_resume_cursor_present(topic: &str, present: bool) {
    gauge!("replication_resume_cursor_present", "topic" => topic.to_string()).set(if present { 1.0 } else { 0.0 });
}

// ═══════════════════════════════════════════════════════════════════════════════
// Apply loop (read path)
// ═══════════════════════════════════════════════════════════════════════════════

/// Record an envelope taken off the channel.
pub fn record_event_received(topic: &str) {
    counter!("replication_events_received_total", "topic" => topic.to_string()).increment(1);
}

/// Record an event applied to the mirror store.
pub fn record_event_applied(topic: &str, kind: &str) {
    counter!("replication_events_applied_total", "topic" => topic.to_string(), "kind" => kind.to_string()).increment(1);
}

/// Record an event skipped because its digest was already seen.
pub fn record_event_deduped(topic: &str) {
    counter!("replication_events_deduped_total", "topic" => topic.to_string()).increment(1);
}

/// Record an event whose type belongs to another entity kind.
pub fn record_event_ignored(topic: &str) {
    counter!("replication_events_ignored_total", "topic" => topic.to_string()).increment(1);
}

/// Record a mirror-store failure while applying.
pub fn record_apply_failure(topic: &str, kind: &str) {
    counter!("replication_apply_failures_total", "topic" => topic.to_string(), "kind" => kind.to_string()).increment(1);
}

/// Record an envelope that failed to decode or verify.
pub fn record_malformed_envelope(topic: &str, reason: &str) {
    counter!("replication_malformed_envelopes_total", "topic" => topic.to_string(), "reason" => reason.to_string()).increment(1);
}

/// Record the number of digests held by the dedup set.
pub fn set_dedup_set_size(topic: &str, size: usize) {
    gauge!("replication_dedup_set_size", "topic" => topic.to_string()).set(size as f64);
}

/// Record apply loop running state (1 = running, 0 = stopped).
pub fn set_apply_loop_running(topic: &str, running: bool) {
    gauge!("replication_apply_loop_running", "topic" => topic.to_string()).set(if running { 1.0 } else { 0.0 });
}
