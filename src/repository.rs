//! Durable repository seam for read-through caching.
//!
//! The cache never talks to the document store itself. Callers that want
//! read-through behavior hand [`EntityCache::fetch`](crate::facade::EntityCache::fetch)
//! a [`DataRepository`] wrapping their database client; tests use
//! [`InMemoryRepository`].

use crate::entity::CacheEntity;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::RwLock;

/// Source of truth for one entity type, usually a document store client.
#[allow(async_fn_in_trait)]
pub trait DataRepository<T: CacheEntity>: Send + Sync {
    /// Load one entity. A missing entity is `Ok(None)`, not an error; `Err`
    /// means the store itself could not answer.
    async fn fetch_by_id(&self, id: &T::Key) -> Result<Option<T>>;

    /// Load several entities, one slot per requested id.
    ///
    /// The default issues one `fetch_by_id` per id and stops at the first
    /// store error.
    async fn fetch_by_ids(&self, ids: &[T::Key]) -> Result<Vec<Option<T>>> {
        let mut loaded = Vec::with_capacity(ids.len());
        for id in ids {
            loaded.push(self.fetch_by_id(id).await?);
        }
        Ok(loaded)
    }
}

/// Repository backed by a map, for tests and local tooling.
///
/// Interior mutability lets tests change the "database" while a cache holds
/// a shared reference to the repository.
pub struct InMemoryRepository<T: CacheEntity> {
    data: RwLock<HashMap<String, T>>,
}

impl<T: CacheEntity> InMemoryRepository<T> {
    pub fn new() -> Self {
        InMemoryRepository {
            data: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or replace the entity under its own cache key.
    pub fn insert(&self, value: T) {
        let id = value.cache_key().to_string();
        if let Ok(mut data) = self.data.write() {
            data.insert(id, value);
        }
    }

    pub fn remove(&self, id: &T::Key) -> Option<T> {
        self.data.write().ok()?.remove(&id.to_string())
    }

    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: CacheEntity> Default for InMemoryRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: CacheEntity> DataRepository<T> for InMemoryRepository<T> {
    async fn fetch_by_id(&self, id: &T::Key) -> Result<Option<T>> {
        let data = self
            .data
            .read()
            .map_err(|e| Error::RepositoryError(e.to_string()))?;
        Ok(data.get(&id.to_string()).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Serialize, Deserialize)]
    struct Payment {
        id: String,
        amount_cents: u64,
    }

    impl CacheEntity for Payment {
        type Key = String;

        fn cache_key(&self) -> Self::Key {
            self.id.clone()
        }

        fn cache_prefix() -> &'static str {
            "payment"
        }
    }

    fn payment(id: &str, amount_cents: u64) -> Payment {
        Payment {
            id: id.to_string(),
            amount_cents,
        }
    }

    #[tokio::test]
    async fn test_fetch_by_id_hit_and_miss() {
        let repo = InMemoryRepository::new();
        repo.insert(payment("p-1", 1250));

        let found = repo.fetch_by_id(&"p-1".to_string()).await.unwrap();
        assert_eq!(found.map(|p| p.amount_cents), Some(1250));
        assert!(repo.fetch_by_id(&"p-2".to_string()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fetch_by_ids_keeps_slots() {
        let repo = InMemoryRepository::new();
        repo.insert(payment("p-1", 100));
        repo.insert(payment("p-3", 300));

        let ids = ["p-1", "p-2", "p-3"].map(String::from);
        let loaded = repo.fetch_by_ids(&ids).await.unwrap();

        let amounts: Vec<Option<u64>> = loaded.iter().map(|p| p.as_ref().map(|p| p.amount_cents)).collect();
        assert_eq!(amounts, vec![Some(100), None, Some(300)]);
    }

    #[test]
    fn test_insert_replaces_and_remove_empties() {
        let repo = InMemoryRepository::new();
        repo.insert(payment("p-1", 100));
        repo.insert(payment("p-1", 200));
        assert_eq!(repo.len(), 1);

        assert_eq!(repo.remove(&"p-1".to_string()).map(|p| p.amount_cents), Some(200));
        assert!(repo.is_empty());
    }
}
