//! Fuzz target for inbound envelope handling.
//!
//! Decoding, digest verification and payload extraction must turn any
//! input into either a value or an error.

#![no_main]

use event_replication::{EventEnvelope, EventKind};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|raw: &str| {
    let Ok(envelope) = EventEnvelope::decode(raw) else {
        return;
    };

    let verified = envelope.verify_digest().is_ok();
    let _ = envelope.kind("WorkLog");
    let _ = envelope.payload::<serde_json::Value>();

    // Re-encoding keeps the digest relationship intact.
    if let Ok(wire) = envelope.encode() {
        if let Ok(text) = std::str::from_utf8(&wire) {
            if let Ok(again) = EventEnvelope::decode(text) {
                assert_eq!(again.verify_digest().is_ok(), verified);
                assert_eq!(again.kind("WorkLog"), envelope.kind("WorkLog"));
            }
        }
    }

    let _ = EventKind::parse("WorkLog", &envelope.event_type);
});
