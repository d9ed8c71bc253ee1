// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Event Replication
//!
//! Mirrors entities across independent service instances through an external
//! append-only event store, without a shared database.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                           EventBroadcaster                                │
//! │                                                                           │
//! │  save/delete ──► EventEnvelope ──► RetryingClient ──► POST /event/{topic} │
//! │                                                                           │
//! │  ┌─────────────┐  mpsc(1)  ┌────────────────────┐    ┌────────────────┐   │
//! │  │ EventStream │──────────►│ ApplyLoop          │───►│ mirror store   │   │
//! │  │ (SSE, GET)  │           │ (dedup by eventSHA)│    │ (Repository)   │   │
//! │  └─────────────┘           └────────────────────┘    └────────────────┘   │
//! │         ▲                                                    ▲            │
//! │         │ Last-Event-ID                         get/get_all  │            │
//! └─────────┼────────────────────────────────────────────────────┼────────────┘
//!           │                                                    │
//!     GET /eventstream/{topic}                              API layer
//! ```
//!
//! ## Guarantees
//!
//! - At-least-once delivery from the event store, made idempotent by
//!   digest deduplication.
//! - Events are applied in stream order; the last one applied wins.
//! - Reads never touch the network.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_replication::{BroadcasterConfig, Entity, EventBroadcaster, InMemoryRepository, Repository};
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct WorkLog {
//!     id: Option<u64>,
//!     description: String,
//! }
//!
//! impl Entity for WorkLog {
//!     type Id = u64;
//!
//!     fn id(&self) -> Option<u64> {
//!         self.id
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> event_replication::Result<()> {
//!     let mirror = Arc::new(InMemoryRepository::<WorkLog>::new());
//!     let Some(config) = BroadcasterConfig::from_env()? else {
//!         return Ok(()); // broadcasting disabled, use `mirror` directly
//!     };
//!
//!     let store = EventBroadcaster::<WorkLog, _>::start(config, mirror)?;
//!     store.save(WorkLog { id: Some(1), description: "x".into() }).await?;
//!
//!     // Runs until shutdown
//!     store.shutdown().await
//! }
//! ```

pub mod apply;
pub mod broadcaster;
pub mod config;
pub mod cursor;
pub mod dedup;
pub mod envelope;
pub mod error;
pub mod metrics;
pub mod repository;
pub mod resilience;
pub mod stream;
pub mod transport;

// Re-exports for convenience
pub use apply::{ApplyLoop, ApplyOutcome, ApplyStats, ApplyStatsSnapshot, MalformedEnvelopePolicy};
pub use broadcaster::{BroadcasterState, EventBroadcaster};
pub use config::{ApplyConfig, BroadcasterConfig, TransportConfig};
pub use cursor::ResumeCursor;
pub use dedup::DedupSet;
pub use envelope::{EventEnvelope, EventKind};
pub use error::{ReplicationError, Result};
pub use repository::{Entity, InMemoryRepository, Repository};
pub use stream::{EventStream, StreamLine};
pub use transport::{HttpRequest, RetryingClient};
