// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Apply loop: inbound events to the mirror store.
//!
//! Drains the event stream's channel and, for each value:
//!
//! 1. Decodes the envelope (and checks its digest, if enabled)
//! 2. Skips it if its digest was already seen, otherwise records the digest
//! 3. Upserts (`Created`/`Updated`) or deletes (`Deleted`) in the mirror store
//!
//! Events for other entity kinds on the same stream are ignored.
//!
//! # Failure Handling
//!
//! | Failure | Effect |
//! |---------|--------|
//! | Undecodable envelope or payload, digest mismatch | per [`MalformedEnvelopePolicy`] |
//! | Mirror store error | logged, event dropped, loop continues |
//! | Delete of an absent id | logged, tolerated |
//!
//! A digest is recorded before the store is touched and is never removed,
//! so an event whose apply failed is not retried on redelivery.
//!
//! The loop ends when the channel closes (the stream task exited) or, under
//! [`MalformedEnvelopePolicy::Halt`], at the first malformed envelope.

use crate::config::ApplyConfig;
use crate::dedup::DedupSet;
use crate::envelope::{EventEnvelope, EventKind};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::repository::{Entity, Repository};
use crate::resilience::RateLimiter;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn, Instrument};

/// What to do with an envelope that cannot be decoded or verified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MalformedEnvelopePolicy {
    /// Stop the apply loop and report the error. Nothing further is applied
    /// until the broadcaster is restarted.
    #[default]
    Halt,
    /// Log and move on to the next event.
    Skip,
}

/// Counters for the apply loop, readable while it runs.
#[derive(Debug, Default)]
pub struct ApplyStats {
    received: AtomicU64,
    applied: AtomicU64,
    deduplicated: AtomicU64,
    ignored: AtomicU64,
    failed: AtomicU64,
    malformed: AtomicU64,
}

/// Point-in-time copy of [`ApplyStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyStatsSnapshot {
    pub received: u64,
    pub applied: u64,
    pub deduplicated: u64,
    pub ignored: u64,
    pub failed: u64,
    pub malformed: u64,
}

impl ApplyStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    pub fn deduplicated(&self) -> u64 {
        self.deduplicated.load(Ordering::Relaxed)
    }

    pub fn ignored(&self) -> u64 {
        self.ignored.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ApplyStatsSnapshot {
        ApplyStatsSnapshot {
            received: self.received(),
            applied: self.applied(),
            deduplicated: self.deduplicated(),
            ignored: self.ignored(),
            failed: self.failed(),
            malformed: self.malformed(),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Result of handling one inbound value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Written to (or removed from) the mirror store.
    Applied(EventKind),
    /// `Deleted` for an id the mirror store did not hold.
    AlreadyAbsent,
    /// Digest already seen.
    Duplicate,
    /// Event type belongs to another entity kind.
    Ignored,
    /// The mirror store rejected the change.
    Failed(EventKind),
}

/// Consumer side of one broadcaster.
///
/// Owns the dedup set; the mirror store is shared with readers.
pub struct ApplyLoop<T: Entity, R: Repository<T>> {
    repo: Arc<R>,
    topic: String,
    prefix: String,
    policy: MalformedEnvelopePolicy,
    verify_digest: bool,
    rate_limiter: Option<RateLimiter>,
    dedup: DedupSet,
    stats: Arc<ApplyStats>,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity, R: Repository<T>> ApplyLoop<T, R> {
    /// Apply `prefix`-typed events from `topic` to `repo`, with default
    /// settings.
    pub fn new(repo: Arc<R>, topic: &str, prefix: &str) -> Self {
        Self {
            repo,
            topic: topic.to_string(),
            prefix: prefix.to_string(),
            policy: MalformedEnvelopePolicy::default(),
            verify_digest: true,
            rate_limiter: None,
            dedup: DedupSet::new(),
            stats: Arc::new(ApplyStats::new()),
            _entity: PhantomData,
        }
    }

    /// Take policy, digest checking and rate limiting from `config`.
    pub fn with_config(mut self, config: &ApplyConfig) -> Self {
        self.policy = config.malformed_envelope;
        self.verify_digest = config.verify_digest;
        self.rate_limiter = config.rate_limit_config().map(RateLimiter::new);
        self
    }

    /// Share counters with an existing handle.
    pub fn with_stats(mut self, stats: Arc<ApplyStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> Arc<ApplyStats> {
        Arc::clone(&self.stats)
    }

    pub fn dedup(&self) -> &DedupSet {
        &self.dedup
    }

    /// Drain `rx` until it closes.
    ///
    /// Returns the malformed-envelope error that stopped the loop under
    /// [`MalformedEnvelopePolicy::Halt`]; otherwise `Ok(())` once the
    /// channel is closed and empty.
    pub async fn run(mut self, mut rx: mpsc::Receiver<String>) -> Result<()> {
        let span = tracing::info_span!("apply_loop", topic = %self.topic, prefix = %self.prefix);

        async move {
            info!(policy = ?self.policy, verify_digest = self.verify_digest, "Starting apply loop");
            metrics::set_apply_loop_running(&self.topic, true);

            let mut result = Ok(());
            while let Some(raw) = rx.recv().await {
                if let Some(ref limiter) = self.rate_limiter {
                    limiter.acquire().await;
                }

                if let Err(e) = self.apply_one(&raw).await {
                    match self.policy {
                        MalformedEnvelopePolicy::Halt => {
                            error!(error = %e, "Malformed envelope, halting apply loop");
                            result = Err(e);
                            break;
                        }
                        MalformedEnvelopePolicy::Skip => {
                            error!(error = %e, "Malformed envelope, skipping");
                        }
                    }
                }
            }

            metrics::set_apply_loop_running(&self.topic, false);
            let stats = self.stats.snapshot();
            info!(
                received = stats.received,
                applied = stats.applied,
                deduplicated = stats.deduplicated,
                failed = stats.failed,
                malformed = stats.malformed,
                "Apply loop stopped"
            );
            result
        }
        .instrument(span)
        .await
    }

    /// Handle one raw `data:` value.
    ///
    /// Only malformed input is returned as an error; store failures are
    /// reported as [`ApplyOutcome::Failed`].
    pub async fn apply_one(&mut self, raw: &str) -> Result<ApplyOutcome> {
        ApplyStats::bump(&self.stats.received);
        metrics::record_event_received(&self.topic);

        let envelope = match self.decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                ApplyStats::bump(&self.stats.malformed);
                let reason = if matches!(e, ReplicationError::DigestMismatch { .. }) {
                    "digest"
                } else {
                    "decode"
                };
                metrics::record_malformed_envelope(&self.topic, reason);
                return Err(e);
            }
        };

        if !self.dedup.check_and_record(&envelope.event_sha, raw) {
            debug!(sha = %envelope.event_sha, event_type = %envelope.event_type, "Duplicate event, skipping");
            ApplyStats::bump(&self.stats.deduplicated);
            metrics::record_event_deduped(&self.topic);
            return Ok(ApplyOutcome::Duplicate);
        }
        metrics::set_dedup_set_size(&self.topic, self.dedup.len());

        let Some(kind) = envelope.kind(&self.prefix) else {
            trace!(event_type = %envelope.event_type, "Ignoring event for another entity kind");
            ApplyStats::bump(&self.stats.ignored);
            metrics::record_event_ignored(&self.topic);
            return Ok(ApplyOutcome::Ignored);
        };

        let entity: T = match envelope.payload() {
            Ok(entity) => entity,
            Err(e) => {
                ApplyStats::bump(&self.stats.malformed);
                metrics::record_malformed_envelope(&self.topic, "payload");
                return Err(e);
            }
        };

        let outcome = if kind.is_upsert() {
            self.repo.save(entity).await
        } else {
            self.repo.delete(entity).await
        };

        match outcome {
            Ok(()) => {
                debug!(sha = %envelope.event_sha, kind = %kind, "Applied event");
                ApplyStats::bump(&self.stats.applied);
                metrics::record_event_applied(&self.topic, kind.as_str());
                Ok(ApplyOutcome::Applied(kind))
            }
            Err(ReplicationError::NotFound(id)) if kind == EventKind::Deleted => {
                warn!(id = %id, sha = %envelope.event_sha, "Delete for absent entity, ignoring");
                ApplyStats::bump(&self.stats.applied);
                metrics::record_event_applied(&self.topic, kind.as_str());
                Ok(ApplyOutcome::AlreadyAbsent)
            }
            Err(e) => {
                warn!(error = %e, sha = %envelope.event_sha, kind = %kind, "Failed to apply event, dropping");
                ApplyStats::bump(&self.stats.failed);
                metrics::record_apply_failure(&self.topic, kind.as_str());
                Ok(ApplyOutcome::Failed(kind))
            }
        }
    }

    fn decode(&self, raw: &str) -> Result<EventEnvelope> {
        let envelope = EventEnvelope::decode(raw)?;
        if self.verify_digest {
            envelope.verify_digest()?;
        }
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRepository;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: Option<u32>,
        text: String,
    }

    impl Entity for Note {
        type Id = u32;

        fn id(&self) -> Option<u32> {
            self.id
        }
    }

    fn note(id: u32, text: &str) -> Note {
        Note {
            id: Some(id),
            text: text.to_string(),
        }
    }

    fn raw(kind: EventKind, entity: &Note) -> String {
        let envelope = EventEnvelope::for_entity(kind, "Note", entity).unwrap();
        String::from_utf8(envelope.encode().unwrap()).unwrap()
    }

    fn new_loop() -> (ApplyLoop<Note, InMemoryRepository<Note>>, Arc<InMemoryRepository<Note>>) {
        let repo = Arc::new(InMemoryRepository::<Note>::new());
        (ApplyLoop::new(Arc::clone(&repo), "notes", "Note"), repo)
    }

    #[tokio::test]
    async fn test_created_and_updated_upsert() {
        let (mut apply, repo) = new_loop();

        let outcome = apply.apply_one(&raw(EventKind::Created, &note(1, "a"))).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied(EventKind::Created));
        let outcome = apply.apply_one(&raw(EventKind::Updated, &note(1, "b"))).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied(EventKind::Updated));

        assert_eq!(repo.get(1).await.unwrap(), Some(note(1, "b")));
        assert_eq!(apply.stats().applied(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_applied_once() {
        let (mut apply, repo) = new_loop();
        let event = raw(EventKind::Created, &note(1, "a"));

        assert_eq!(apply.apply_one(&event).await.unwrap(), ApplyOutcome::Applied(EventKind::Created));
        repo.delete(note(1, "a")).await.unwrap();
        assert_eq!(apply.apply_one(&event).await.unwrap(), ApplyOutcome::Duplicate);

        // The replay did not re-insert.
        assert!(!repo.exists(1).await.unwrap());
        let stats = apply.stats().snapshot();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.applied, 1);
        assert_eq!(stats.deduplicated, 1);
    }

    #[tokio::test]
    async fn test_shared_stats_count_both_loops() {
        let stats = Arc::new(ApplyStats::new());
        let repo = Arc::new(InMemoryRepository::<Note>::new());
        let mut first = ApplyLoop::new(Arc::clone(&repo), "notes", "Note").with_stats(Arc::clone(&stats));
        let mut second = ApplyLoop::new(Arc::clone(&repo), "notes", "Note").with_stats(Arc::clone(&stats));

        first.apply_one(&raw(EventKind::Created, &note(1, "a"))).await.unwrap();
        second.apply_one(&raw(EventKind::Created, &note(2, "b"))).await.unwrap();

        assert!(Arc::ptr_eq(&first.stats(), &stats));
        assert_eq!(stats.received(), 2);
        assert_eq!(stats.applied(), 2);
    }

    #[tokio::test]
    async fn test_same_content_different_type_is_duplicate() {
        let (mut apply, repo) = new_loop();
        let n = note(1, "a");

        apply.apply_one(&raw(EventKind::Created, &n)).await.unwrap();
        // Identical payload, so identical digest.
        let outcome = apply.apply_one(&raw(EventKind::Deleted, &n)).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Duplicate);
        assert!(repo.exists(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete() {
        let (mut apply, repo) = new_loop();
        apply.apply_one(&raw(EventKind::Created, &note(1, "a"))).await.unwrap();

        // Different content than the create, so not a duplicate.
        let outcome = apply.apply_one(&raw(EventKind::Deleted, &note(1, "a-final"))).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied(EventKind::Deleted));
        assert!(repo.is_empty().await);
    }

    #[tokio::test]
    async fn test_delete_absent_is_tolerated() {
        let (mut apply, repo) = new_loop();
        repo.save(note(2, "keep")).await.unwrap();

        let outcome = apply.apply_one(&raw(EventKind::Deleted, &note(9, "x"))).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::AlreadyAbsent);
        assert_eq!(repo.len().await, 1);
        assert_eq!(apply.stats().failed(), 0);
    }

    #[tokio::test]
    async fn test_other_prefix_ignored() {
        let (mut apply, repo) = new_loop();
        let envelope = EventEnvelope::new(EventKind::Created, "Task", r#"{"id":1,"text":"t"}"#.into());
        let event = String::from_utf8(envelope.encode().unwrap()).unwrap();

        assert_eq!(apply.apply_one(&event).await.unwrap(), ApplyOutcome::Ignored);
        assert!(repo.is_empty().await);
        assert_eq!(apply.stats().ignored(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_is_dropped() {
        let (mut apply, repo) = new_loop();
        // No id: the store refuses it.
        let event = raw(EventKind::Created, &Note { id: None, text: "x".into() });

        assert_eq!(apply.apply_one(&event).await.unwrap(), ApplyOutcome::Failed(EventKind::Created));
        assert!(repo.is_empty().await);
        assert_eq!(apply.stats().failed(), 1);
        // Recorded anyway: redelivery does not retry.
        assert_eq!(apply.apply_one(&event).await.unwrap(), ApplyOutcome::Duplicate);
    }

    #[tokio::test]
    async fn test_malformed_json() {
        let (mut apply, _repo) = new_loop();
        let err = apply.apply_one("{not json").await.unwrap_err();
        assert!(err.is_malformed());
        assert_eq!(apply.stats().malformed(), 1);
        assert!(apply.dedup().is_empty());
    }

    #[tokio::test]
    async fn test_digest_mismatch() {
        let (mut apply, repo) = new_loop();
        let mut envelope = EventEnvelope::for_entity(EventKind::Created, "Note", &note(1, "a")).unwrap();
        envelope.event_data = r#"{"id":1,"text":"tampered"}"#.into();
        let event = String::from_utf8(envelope.encode().unwrap()).unwrap();

        let err = apply.apply_one(&event).await.unwrap_err();
        assert!(matches!(err, ReplicationError::DigestMismatch { .. }));
        assert!(repo.is_empty().await);
    }

    #[tokio::test]
    async fn test_digest_check_disabled() {
        let repo = Arc::new(InMemoryRepository::<Note>::new());
        let config = ApplyConfig {
            verify_digest: false,
            ..Default::default()
        };
        let mut apply = ApplyLoop::<Note, _>::new(Arc::clone(&repo), "notes", "Note").with_config(&config);

        let mut envelope = EventEnvelope::for_entity(EventKind::Created, "Note", &note(1, "a")).unwrap();
        envelope.event_sha = "not-a-digest".into();
        let event = String::from_utf8(envelope.encode().unwrap()).unwrap();

        assert_eq!(apply.apply_one(&event).await.unwrap(), ApplyOutcome::Applied(EventKind::Created));
        assert!(repo.exists(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_malformed() {
        let (mut apply, _repo) = new_loop();
        let envelope = EventEnvelope::new(EventKind::Created, "Note", r#"{"id":"one"}"#.into());
        let event = String::from_utf8(envelope.encode().unwrap()).unwrap();

        assert!(apply.apply_one(&event).await.unwrap_err().is_malformed());
    }

    #[tokio::test]
    async fn test_run_halts_on_malformed() {
        let (apply, repo) = new_loop();
        let stats = apply.stats();
        let (tx, rx) = mpsc::channel(8);

        tx.send(raw(EventKind::Created, &note(1, "a"))).await.unwrap();
        tx.send("garbage".to_string()).await.unwrap();
        tx.send(raw(EventKind::Created, &note(2, "b"))).await.unwrap();
        drop(tx);

        let err = apply.run(rx).await.unwrap_err();
        assert!(err.is_malformed());
        assert!(repo.exists(1).await.unwrap());
        assert!(!repo.exists(2).await.unwrap());
        assert_eq!(stats.received(), 2);
    }

    #[tokio::test]
    async fn test_run_skips_malformed() {
        let repo = Arc::new(InMemoryRepository::<Note>::new());
        let config = ApplyConfig {
            malformed_envelope: MalformedEnvelopePolicy::Skip,
            ..Default::default()
        };
        let apply = ApplyLoop::<Note, _>::new(Arc::clone(&repo), "notes", "Note").with_config(&config);
        let (tx, rx) = mpsc::channel(8);

        tx.send("garbage".to_string()).await.unwrap();
        tx.send(raw(EventKind::Created, &note(2, "b"))).await.unwrap();
        drop(tx);

        apply.run(rx).await.unwrap();
        assert!(repo.exists(2).await.unwrap());
    }

    #[tokio::test]
    async fn test_run_ends_when_channel_closes() {
        let (apply, _repo) = new_loop();
        let (tx, rx) = mpsc::channel::<String>(1);
        drop(tx);
        apply.run(rx).await.unwrap();
    }

    #[test]
    fn test_policy_serde() {
        let policy: MalformedEnvelopePolicy = serde_json::from_str("\"skip\"").unwrap();
        assert_eq!(policy, MalformedEnvelopePolicy::Skip);
        assert_eq!(serde_json::to_string(&MalformedEnvelopePolicy::Halt).unwrap(), "\"halt\"");
        assert_eq!(MalformedEnvelopePolicy::default(), MalformedEnvelopePolicy::Halt);
    }
}
