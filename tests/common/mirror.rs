//! Recording mirror store and the `WorkLog` fixture entity.
//!
//! Records every save() and delete() that reaches the store, so tests can
//! assert how many times an event was actually applied. Failures can be
//! switched on to exercise the apply loop's error path.

use event_replication::repository::{BoxFuture, Entity, InMemoryRepository, Repository};
use event_replication::ReplicationError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

/// Minimal entity: the record-keeping service's work log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkLog {
    pub id: Option<u64>,
    pub description: String,
    #[serde(default)]
    pub minutes: u32,
}

impl Entity for WorkLog {
    type Id = u64;

    fn id(&self) -> Option<u64> {
        self.id
    }
}

pub fn work_log(id: u64, description: &str) -> WorkLog {
    WorkLog {
        id: Some(id),
        description: description.to_string(),
        minutes: 30,
    }
}

/// A recorded store call.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCall {
    Save(WorkLog),
    Delete(WorkLog),
}

/// In-memory store that records writes.
///
/// # Example
/// ```rust,ignore
/// let store = RecordingRepository::new();
///
/// // Use as the broadcaster's mirror...
///
/// assert_eq!(store.saves().await.len(), 1);
/// ```
#[derive(Default)]
pub struct RecordingRepository {
    inner: InMemoryRepository<WorkLog>,
    calls: RwLock<Vec<StoreCall>>,
    fail_writes: AtomicBool,
    write_delay_ms: AtomicU64,
}

impl RecordingRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with a repository error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent write take this long.
    pub fn set_write_delay(&self, delay: Duration) {
        self.write_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    async fn write_pause(&self) {
        let ms = self.write_delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    pub async fn calls(&self) -> Vec<StoreCall> {
        self.calls.read().await.clone()
    }

    pub async fn saves(&self) -> Vec<WorkLog> {
        self.calls
            .read()
            .await
            .iter()
            .filter_map(|call| match call {
                StoreCall::Save(log) => Some(log.clone()),
                StoreCall::Delete(_) => None,
            })
            .collect()
    }

    pub async fn deletes(&self) -> Vec<WorkLog> {
        self.calls
            .read()
            .await
            .iter()
            .filter_map(|call| match call {
                StoreCall::Delete(log) => Some(log.clone()),
                StoreCall::Save(_) => None,
            })
            .collect()
    }

    fn check_failure(&self) -> event_replication::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(ReplicationError::Repository("injected write failure".into()))
        } else {
            Ok(())
        }
    }
}

impl Repository<WorkLog> for RecordingRepository {
    fn save(&self, entity: WorkLog) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.calls.write().await.push(StoreCall::Save(entity.clone()));
            self.write_pause().await;
            self.check_failure()?;
            self.inner.save(entity).await
        })
    }

    fn get(&self, id: u64) -> BoxFuture<'_, Option<WorkLog>> {
        self.inner.get(id)
    }

    fn get_all(&self) -> BoxFuture<'_, Vec<WorkLog>> {
        self.inner.get_all()
    }

    fn delete(&self, entity: WorkLog) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.calls.write().await.push(StoreCall::Delete(entity.clone()));
            self.write_pause().await;
            self.check_failure()?;
            self.inner.delete(entity).await
        })
    }

    fn exists(&self, id: u64) -> BoxFuture<'_, bool> {
        self.inner.exists(id)
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
