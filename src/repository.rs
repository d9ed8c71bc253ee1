// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Mirror store contract.
//!
//! [`Repository`] is the read/write capability set shared by the plain local
//! store and the [`EventBroadcaster`](crate::EventBroadcaster) wrapping it,
//! so either can be handed to code that only needs storage.
//!
//! # Example
//!
//! ```rust,no_run
//! use event_replication::repository::{Entity, InMemoryRepository, Repository};
//! use serde::{Deserialize, Serialize};
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
//! # async fn example() -> event_replication::Result<()> {
//! let store = InMemoryRepository::<WorkLog>::new();
//! store.save(WorkLog { id: Some(1), description: "x".into() }).await?;
//! assert!(store.exists(1).await?);
//! # Ok(())
//! # }
//! ```

use crate::error::{ReplicationError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use tokio::sync::RwLock;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// A storable, broadcastable record.
///
/// The serialized form is what gets digested and shipped in `eventData`.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Stable identifier.
    type Id: Eq + Hash + Clone + Debug + Display + Send + Sync + 'static;

    /// The identifier, if one has been assigned.
    fn id(&self) -> Option<Self::Id>;
}

/// Read/write capabilities of a mirror store.
pub trait Repository<T: Entity>: Send + Sync + 'static {
    /// Insert or overwrite.
    fn save(&self, entity: T) -> BoxFuture<'_, ()>;

    fn get(&self, id: T::Id) -> BoxFuture<'_, Option<T>>;

    /// Every stored entity, in no particular order.
    fn get_all(&self) -> BoxFuture<'_, Vec<T>>;

    /// Remove the entity with `entity`'s identifier.
    ///
    /// Fails with [`ReplicationError::NotFound`] if it is not stored.
    fn delete(&self, entity: T) -> BoxFuture<'_, ()>;

    fn exists(&self, id: T::Id) -> BoxFuture<'_, bool>;

    /// Identifier of `entity`, or [`ReplicationError::MissingId`].
    fn get_id(&self, entity: &T) -> Result<T::Id> {
        entity.id().ok_or(ReplicationError::MissingId)
    }
}

/// Map-backed store. Concurrent readers, one writer at a time.
#[derive(Debug)]
pub struct InMemoryRepository<T: Entity> {
    items: RwLock<HashMap<T::Id, T>>,
}

impl<T: Entity> Default for InMemoryRepository<T> {
    fn default() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Entity> InMemoryRepository<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }
}

impl<T: Entity> Repository<T> for InMemoryRepository<T> {
    fn save(&self, entity: T) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let id = self.get_id(&entity)?;
            self.items.write().await.insert(id, entity);
            Ok(())
        })
    }

    fn get(&self, id: T::Id) -> BoxFuture<'_, Option<T>> {
        Box::pin(async move { Ok(self.items.read().await.get(&id).cloned()) })
    }

    fn get_all(&self) -> BoxFuture<'_, Vec<T>> {
        Box::pin(async move { Ok(self.items.read().await.values().cloned().collect()) })
    }

    fn delete(&self, entity: T) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let id = self.get_id(&entity)?;
            match self.items.write().await.remove(&id) {
                Some(_) => Ok(()),
                None => Err(ReplicationError::NotFound(id.to_string())),
            }
        })
    }

    fn exists(&self, id: T::Id) -> BoxFuture<'_, bool> {
        Box::pin(async move { Ok(self.items.read().await.contains_key(&id)) })
    }
}
