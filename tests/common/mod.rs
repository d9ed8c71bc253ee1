//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - An in-process mock event store (HTTP POST + event stream)
//! - A recording mirror store and the `WorkLog` fixture
//! - Envelope helpers

#![allow(dead_code)]

pub mod event_store;
pub mod mirror;

pub use event_store::*;
pub use mirror::*;

use event_replication::{BroadcasterConfig, EventEnvelope, EventKind};
use std::time::Duration;

/// How long tests wait for an event to travel through the mock store.
pub const PROPAGATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Fast-retry config pointed at `store`, for `WorkLog` events.
pub fn test_config(store: &MockEventStore) -> BroadcasterConfig {
    BroadcasterConfig::for_testing(&store.uri())
}

/// Wire text of an envelope for `log`.
pub fn envelope_text(kind: EventKind, log: &WorkLog) -> String {
    let envelope = EventEnvelope::for_entity(kind, "WorkLog", log).unwrap();
    String::from_utf8(envelope.encode().unwrap()).unwrap()
}

/// Decode a POST body captured by the mock store.
pub fn decode_posted(body: &[u8]) -> EventEnvelope {
    EventEnvelope::decode(std::str::from_utf8(body).unwrap()).unwrap()
}
