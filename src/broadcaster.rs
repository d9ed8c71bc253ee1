// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Event broadcaster: a mirror store whose writes travel through the event
//! store.
//!
//! [`EventBroadcaster`] implements [`Repository`] over a wrapped local
//! mirror store, so it can stand in wherever that store is used:
//!
//! - **Writes** (`save`, `delete`) are turned into envelopes and POSTed to
//!   `{broadcast_uri}/event/{topic}`. The local store is *not* touched; it
//!   changes when the event comes back through the stream.
//! - **Reads** (`get`, `get_all`, `exists`, `get_id`) go straight to the
//!   local store and never touch the network.
//!
//! # Tasks
//!
//! ```text
//!   ┌──────────────┐  mpsc(1)  ┌────────────┐        ┌──────────────┐
//!   │ EventStream  │──────────►│ ApplyLoop  │───────►│ mirror store │
//!   │ (SSE reader) │   data:   │ (dedup +   │  save/ │              │◄── get/get_all
//!   └──────────────┘           │  dispatch) │  delete└──────────────┘
//!          ▲                   └────────────┘
//!          │ GET /eventstream/{topic}
//!    event store ◄──────────── POST /event/{topic} ◄── save/delete
//! ```
//!
//! Both tasks start in [`start()`](EventBroadcaster::start) and stop on
//! [`shutdown()`](EventBroadcaster::shutdown) (or when the broadcaster is
//! dropped). The apply loop drains what the stream already handed over and
//! then ends.
//!
//! # Read-Your-Writes
//!
//! There is none. A `save` followed immediately by `get` usually returns the
//! old value, and `save` picks `Created` vs `Updated` from the local store,
//! which may not have seen this process's previous write yet. Consumers
//! treat both as an upsert, so the misclassification is harmless.

use crate::apply::{ApplyLoop, ApplyStats};
use crate::config::BroadcasterConfig;
use crate::cursor::ResumeCursor;
use crate::envelope::{EventEnvelope, EventKind};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::repository::{BoxFuture, Entity, Repository};
use crate::stream::EventStream;
use crate::transport::{HttpRequest, RetryingClient};
use reqwest::StatusCode;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long shutdown waits for each background task.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle of a broadcaster.
///
/// ```text
/// Running ──shutdown()──► ShuttingDown ──► Stopped
///    │
///    └──malformed envelope (Halt policy)──► Halted ──shutdown()──► ShuttingDown
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcasterState {
    /// Streaming and applying.
    Running,
    /// The apply loop stopped on a malformed envelope. Writes still go out,
    /// but nothing is applied locally any more.
    Halted,
    ShuttingDown,
    Stopped,
}

impl std::fmt::Display for BroadcasterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BroadcasterState::Running => write!(f, "Running"),
            BroadcasterState::Halted => write!(f, "Halted"),
            BroadcasterState::ShuttingDown => write!(f, "ShuttingDown"),
            BroadcasterState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Broadcasting façade over a local mirror store.
pub struct EventBroadcaster<T: Entity, R: Repository<T>> {
    repo: Arc<R>,
    client: RetryingClient,
    post_url: String,
    topic: String,
    prefix: String,
    cursor: ResumeCursor,
    stats: Arc<ApplyStats>,
    state_tx: Arc<watch::Sender<BroadcasterState>>,
    state_rx: watch::Receiver<BroadcasterState>,
    shutdown_tx: watch::Sender<bool>,
    stream_handle: Mutex<Option<JoinHandle<()>>>,
    apply_handle: Mutex<Option<JoinHandle<Result<()>>>>,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity, R: Repository<T>> EventBroadcaster<T, R> {
    /// Validate `config`, then spawn the stream reader and apply loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: BroadcasterConfig, repo: Arc<R>) -> Result<Self> {
        config.validate()?;

        let client = RetryingClient::new(config.transport.retry_config())?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(BroadcasterState::Running);
        let state_tx = Arc::new(state_tx);

        info!(
            topic = %config.topic,
            prefix = %config.event_type_prefix,
            broadcast_uri = %config.broadcast_uri,
            stream_uri = %config.stream_uri,
            "Starting event broadcaster"
        );

        let stream = EventStream::new(client.clone(), &config.stream_uri, &config.topic)
            .with_reconnect_delay(config.transport.reconnect_delay_duration());
        let cursor = stream.cursor();
        let (events_rx, stream_handle) = stream.spawn(shutdown_rx);

        let apply = ApplyLoop::new(Arc::clone(&repo), &config.topic, &config.event_type_prefix)
            .with_config(&config.apply);
        let stats = apply.stats();
        let apply_state = Arc::clone(&state_tx);
        let apply_handle = tokio::spawn(async move {
            let result = apply.run(events_rx).await;
            if result.is_err() {
                apply_state.send_replace(BroadcasterState::Halted);
            }
            result
        });

        Ok(Self {
            repo,
            client,
            post_url: format!(
                "{}/event/{}",
                config.broadcast_uri.trim_end_matches('/'),
                config.topic
            ),
            topic: config.topic,
            prefix: config.event_type_prefix,
            cursor,
            stats,
            state_tx,
            state_rx,
            shutdown_tx,
            stream_handle: Mutex::new(Some(stream_handle)),
            apply_handle: Mutex::new(Some(apply_handle)),
            _entity: PhantomData,
        })
    }

    /// The wrapped mirror store.
    pub fn mirror(&self) -> &Arc<R> {
        &self.repo
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Apply loop counters.
    pub fn stats(&self) -> &Arc<ApplyStats> {
        &self.stats
    }

    /// Resume cursor of the stream reader.
    pub fn cursor(&self) -> &ResumeCursor {
        &self.cursor
    }

    pub fn state(&self) -> BroadcasterState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<BroadcasterState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state() == BroadcasterState::Running
    }

    fn accepting_writes(&self) -> bool {
        !matches!(
            self.state(),
            BroadcasterState::ShuttingDown | BroadcasterState::Stopped
        )
    }

    /// POST an envelope to the event store.
    ///
    /// Succeeds only on `201 Created`. Any other final status, or a transport
    /// error once retries are exhausted, is returned as an error.
    pub async fn post_event(&self, envelope: &EventEnvelope) -> Result<()> {
        let kind = envelope.kind(&self.prefix).map_or("other", EventKind::as_str);
        let body = envelope.encode()?;
        let request = HttpRequest::post(self.post_url.as_str(), body)
            .header("Content-Type", "application/json");
        let operation = format!("POST {}", self.post_url);

        let started = Instant::now();
        let response = match self.client.execute(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, event_type = %envelope.event_type, "Failed to post event");
                metrics::record_envelope_post_error(&self.topic, kind);
                return Err(ReplicationError::transport(operation, e));
            }
        };

        let status = response.status();
        metrics::record_envelope_posted(&self.topic, kind, status.as_u16(), started.elapsed());

        if status == StatusCode::CREATED {
            debug!(
                event_type = %envelope.event_type,
                sha = %envelope.event_sha,
                duration_ms = started.elapsed().as_millis() as u64,
                "Posted event"
            );
            Ok(())
        } else {
            warn!(status = status.as_u16(), event_type = %envelope.event_type, "Event store rejected event");
            Err(ReplicationError::status(operation, StatusCode::CREATED.as_u16(), status.as_u16()))
        }
    }

    async fn broadcast(&self, kind: EventKind, entity: &T) -> Result<()> {
        if !self.accepting_writes() {
            return Err(ReplicationError::Shutdown);
        }
        let envelope = EventEnvelope::for_entity(kind, &self.prefix, entity)?;
        self.post_event(&envelope).await
    }

    async fn broadcast_save(&self, entity: T) -> Result<()> {
        let id = self.repo.get_id(&entity)?;
        let kind = if self.repo.exists(id).await? {
            EventKind::Updated
        } else {
            EventKind::Created
        };
        self.broadcast(kind, &entity).await
    }

    /// Wait for the apply loop to end and return its result.
    ///
    /// Without a prior [`shutdown()`](Self::shutdown) this returns only once
    /// the loop halts on a malformed envelope. Later calls return `Ok(())`.
    pub async fn join(&self) -> Result<()> {
        let Some(handle) = self.apply_handle.lock().await.take() else {
            return Ok(());
        };
        match handle.await {
            Ok(result) => result,
            Err(e) => Err(ReplicationError::Internal(format!("apply loop task failed: {e}"))),
        }
    }

    /// Stop both tasks and wait for them.
    ///
    /// Returns the apply loop's result: the malformed-envelope error if it
    /// halted, `Ok(())` otherwise.
    pub async fn shutdown(&self) -> Result<()> {
        info!(topic = %self.topic, "Shutting down event broadcaster");
        self.state_tx.send_replace(BroadcasterState::ShuttingDown);
        let _ = self.shutdown_tx.send(true);

        // Take each handle out before awaiting it so `join()` never waits
        // on the lock.
        let stream_handle = self.stream_handle.lock().await.take();
        if let Some(mut handle) = stream_handle {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => debug!("Stream task completed"),
                Ok(Err(e)) => warn!(error = %e, "Stream task panicked"),
                Err(_) => {
                    warn!("Stream task timed out during shutdown, aborting");
                    handle.abort();
                }
            }
        }

        let apply_handle = self.apply_handle.lock().await.take();
        let result = match apply_handle {
            Some(mut handle) => match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut handle).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => Err(ReplicationError::Internal(format!("apply loop task failed: {e}"))),
                Err(_) => {
                    warn!("Apply loop timed out during shutdown, aborting");
                    handle.abort();
                    Ok(())
                }
            },
            None => Ok(()),
        };

        self.state_tx.send_replace(BroadcasterState::Stopped);
        info!(topic = %self.topic, "Event broadcaster stopped");
        result
    }
}

impl<T: Entity, R: Repository<T>> Repository<T> for EventBroadcaster<T, R> {
    /// Broadcast `Created` or `Updated`; the local store is updated when the
    /// event is echoed back.
    fn save(&self, entity: T) -> BoxFuture<'_, ()> {
        Box::pin(self.broadcast_save(entity))
    }

    fn get(&self, id: T::Id) -> BoxFuture<'_, Option<T>> {
        self.repo.get(id)
    }

    fn get_all(&self) -> BoxFuture<'_, Vec<T>> {
        self.repo.get_all()
    }

    /// Broadcast `Deleted` for the entity as given.
    fn delete(&self, entity: T) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.broadcast(EventKind::Deleted, &entity).await })
    }

    fn exists(&self, id: T::Id) -> BoxFuture<'_, bool> {
        self.repo.exists(id)
    }

    fn get_id(&self, entity: &T) -> Result<T::Id> {
        self.repo.get_id(entity)
    }
}

impl<T: Entity, R: Repository<T>> Drop for EventBroadcaster<T, R> {
    fn drop(&mut self) {
        // Lets the background tasks wind down on their own.
        let _ = self.shutdown_tx.send(true);
    }
}
