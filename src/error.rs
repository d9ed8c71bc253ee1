// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication layer.
//!
//! Errors are categorized by where they arise (transport, serialization,
//! inbound envelopes, mirror store) and carry enough context to log usefully.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Transport` | Yes | Connection refused, reset, timed out |
//! | `UnexpectedStatus` | 502/503/504 only | Event store answered with the wrong status |
//! | `Serialization` | No | Entity or envelope could not be encoded |
//! | `MalformedEnvelope` | No | Inbound event text is not a valid envelope |
//! | `DigestMismatch` | No | `eventSHA` does not match `eventData` |
//! | `MissingId` | No | Entity has no identifier |
//! | `NotFound` | No | Mirror store has no entity with that id |
//! | `Repository` | No | Mirror store backend failure |
//! | `Config` | No | Configuration invalid |
//! | `Shutdown` | No | Broadcaster is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! The resilient transport in [`crate::transport`] never produces these:
//! it hands `reqwest` results back unmodified. Wrapping happens one level
//! up, in the broadcaster and stream client.

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur while broadcasting or applying events.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// HTTP request failed before a response was received.
    ///
    /// Only surfaced after the resilient transport exhausted its retries.
    #[error("Transport error ({operation}): {message}")]
    Transport {
        operation: String,
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// The remote answered with a status other than the one expected.
    #[error("Unexpected status ({operation}): expected {expected}, got {status}")]
    UnexpectedStatus {
        operation: String,
        expected: u16,
        status: u16,
    },

    /// Entity or envelope (de)serialization failure on the write path.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Inbound event text could not be decoded.
    ///
    /// Either the envelope JSON itself or the entity payload inside it.
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Content digest does not match the payload it claims to cover.
    #[error("Digest mismatch: envelope says {expected}, payload hashes to {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Entity has no identifier and cannot be stored.
    #[error("Entity identifier is required")]
    MissingId,

    /// No entity with the given identifier exists in the mirror store.
    #[error("Entity not found: {0}")]
    NotFound(String),

    /// Mirror store backend failure.
    #[error("Repository error: {0}")]
    Repository(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a transport error from a `reqwest::Error`.
    pub fn transport(operation: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a transport error without source.
    pub fn transport_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create an unexpected-status error.
    pub fn status(operation: impl Into<String>, expected: u16, status: u16) -> Self {
        Self::UnexpectedStatus {
            operation: operation.into(),
            expected,
            status,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::UnexpectedStatus { status, .. } => matches!(status, 502..=504),
            Self::Serialization(_) => false,
            Self::MalformedEnvelope(_) => false,
            Self::DigestMismatch { .. } => false,
            Self::MissingId => false,
            Self::NotFound(_) => false,
            Self::Repository(_) => false,
            Self::Config(_) => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Check if this error describes a bad inbound event.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::MalformedEnvelope(_) | Self::DigestMismatch { .. })
    }
}
