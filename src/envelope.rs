// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Event envelopes: the typed, digested wrapper broadcast for every write.
//!
//! # Wire Format
//!
//! ```json
//! {
//!   "eventType": "WorkLogCreated",
//!   "eventTime": "2026-10-18T09:30:00.123456Z",
//!   "eventVersion": 1,
//!   "eventSHA": "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9",
//!   "eventData": "{\"id\":7,\"description\":\"x\"}"
//! }
//! ```
//!
//! `eventData` is the serialized entity JSON carried as a string (so it is
//! encoded twice on the wire). `eventSHA` is the hex SHA256 of exactly those
//! bytes. It doubles as the deduplication key: two writes with identical
//! content produce the same digest and the second is treated as seen.
//!
//! Several entity kinds can share a stream; each uses its own `eventType`
//! prefix (`WorkLog`, `Task`, ...).

use crate::error::{ReplicationError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Envelope schema version written by this crate.
pub const EVENT_VERSION: u32 = 1;

/// What happened to the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

impl EventKind {
    fn suffix(self) -> &'static str {
        match self {
            EventKind::Created => "Created",
            EventKind::Updated => "Updated",
            EventKind::Deleted => "Deleted",
        }
    }

    /// Full event type for an entity prefix, e.g. `WorkLogCreated`.
    pub fn event_type(self, prefix: &str) -> String {
        format!("{}{}", prefix, self.suffix())
    }

    /// Parse an event type belonging to `prefix`.
    ///
    /// Returns `None` for other prefixes and unknown suffixes.
    pub fn parse(prefix: &str, event_type: &str) -> Option<Self> {
        match event_type.strip_prefix(prefix)? {
            "Created" => Some(EventKind::Created),
            "Updated" => Some(EventKind::Updated),
            "Deleted" => Some(EventKind::Deleted),
            _ => None,
        }
    }

    /// `Created` and `Updated` are both applied as an upsert.
    pub fn is_upsert(self) -> bool {
        matches!(self, EventKind::Created | EventKind::Updated)
    }

    /// Metrics/log label.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Updated => "updated",
            EventKind::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.suffix())
    }
}

/// A broadcast event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_type: String,
    pub event_time: DateTime<Utc>,
    pub event_version: u32,
    #[serde(rename = "eventSHA")]
    pub event_sha: String,
    pub event_data: String,
}

impl EventEnvelope {
    /// Wrap an already-serialized entity payload.
    pub fn new(kind: EventKind, prefix: &str, payload: String) -> Self {
        Self {
            event_type: kind.event_type(prefix),
            event_time: Utc::now(),
            event_version: EVENT_VERSION,
            event_sha: compute_content_hash(payload.as_bytes()),
            event_data: payload,
        }
    }

    /// Serialize `entity` and wrap it.
    pub fn for_entity<T: Serialize>(kind: EventKind, prefix: &str, entity: &T) -> Result<Self> {
        let payload = serde_json::to_string(entity)?;
        Ok(Self::new(kind, prefix, payload))
    }

    /// Decode one `data:` value from the event stream.
    pub fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| ReplicationError::MalformedEnvelope(format!("{e}: {raw}")))
    }

    /// Encode for the wire.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Classify this envelope for the given entity prefix.
    pub fn kind(&self, prefix: &str) -> Option<EventKind> {
        EventKind::parse(prefix, &self.event_type)
    }

    /// Check that `event_sha` covers `event_data`.
    pub fn verify_digest(&self) -> Result<()> {
        let actual = compute_content_hash(self.event_data.as_bytes());
        if actual.eq_ignore_ascii_case(&self.event_sha) {
            Ok(())
        } else {
            Err(ReplicationError::DigestMismatch {
                expected: self.event_sha.clone(),
                actual,
            })
        }
    }

    /// Deserialize the carried entity.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.event_data).map_err(|e| {
            ReplicationError::MalformedEnvelope(format!(
                "undecodable {} payload ({}): {}",
                self.event_type, self.event_sha, e
            ))
        })
    }
}

/// Compute SHA256 content hash as hex string.
pub fn compute_content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
