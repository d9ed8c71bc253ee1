// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resume cursor for the event stream.
//!
//! Holds the last event id parsed from an `id:` line. It is sent back as
//! `Last-Event-ID` on every (re)connect so the server can skip events we
//! already received.
//!
//! ## Cursor Semantics
//!
//! - Starts empty (`""`), meaning "from wherever the server starts".
//! - Advanced only after a complete `id:` line is parsed.
//! - Never rolled back: a reconnect resumes from the last advanced value,
//!   even if events after it were still in flight when the connection died.
//!
//! The cursor lives in memory only. The external event store owns
//! durability. After a restart the cursor and the dedup set both start
//! empty, the stream replays from the beginning and the mirror is rebuilt.
//!
//! Clones share the same underlying value, so the stream task can advance
//! it while callers observe it.

use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::trace;

#[derive(Debug, Clone, Default)]
pub struct ResumeCursor {
    inner: Arc<RwLock<String>>,
}

impl ResumeCursor {
    /// Empty cursor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cursor resuming from a known event id.
    pub fn starting_at(id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(id.into())),
        }
    }

    /// Current value (`""` if no id has been seen).
    pub async fn get(&self) -> String {
        self.inner.read().await.clone()
    }

    /// Record the id from a parsed `id:` line.
    pub async fn advance(&self, id: &str) {
        let mut guard = self.inner.write().await;
        trace!(from = %*guard, to = %id, "Advancing resume cursor");
        guard.clear();
        guard.push_str(id);
    }

    /// Whether any id has been recorded.
    pub async fn is_set(&self) -> bool {
        !self.inner.read().await.is_empty()
    }
}
