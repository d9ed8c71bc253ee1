// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Digest-based deduplication of inbound events.
//!
//! The event stream delivers at-least-once: reconnects replay events the
//! server could not skip, and our own writes come back to us as echoes.
//! Every envelope's `eventSHA` is recorded the first time it is seen; an
//! envelope whose digest is already present is never applied again.
//!
//! The set is unbounded for the lifetime of the process. There is no
//! eviction: event volume is assumed bounded by the process lifetime.
//! It is owned by the apply loop alone, so no locking is needed.

use std::collections::HashMap;

/// Map from content digest to the raw event text that introduced it.
#[derive(Debug, Default)]
pub struct DedupSet {
    seen: HashMap<String, String>,
}

impl DedupSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `digest` if new.
    ///
    /// Returns `true` if the digest was not seen before (the event should be
    /// applied), `false` if it is a duplicate.
    pub fn check_and_record(&mut self, digest: &str, raw: &str) -> bool {
        if self.seen.contains_key(digest) {
            return false;
        }
        self.seen.insert(digest.to_string(), raw.to_string());
        true
    }

    pub fn contains(&self, digest: &str) -> bool {
        self.seen.contains_key(digest)
    }

    /// Raw event text first recorded under `digest`.
    pub fn original(&self, digest: &str) -> Option<&str> {
        self.seen.get(digest).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
