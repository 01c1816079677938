//! In-memory storage backend.
//!
//! Keeps the "persisted" record set in a shared vector. Loads clone it,
//! saves replace it. Handy in tests (inspect what the engine last saved)
//! and for running the engine as a plain TTL map with no durability.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::CacheError;
use crate::record::Record;
use crate::traits::Storage;

/// Storage backend over a shared in-memory vector.
///
/// Clones share the same underlying record set, so a test can hold one
/// handle and give another to the engine.
///
/// # Example
///
/// ```
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// use stashkit::record::Record;
/// use stashkit::store::MemoryStorage;
/// use stashkit::traits::Storage;
///
/// let storage: MemoryStorage<i32, u64, u64> = MemoryStorage::new();
/// storage.save(vec![Record::new("a".into(), 1)]).await.unwrap();
///
/// let mirror = storage.clone();
/// assert_eq!(mirror.load().await.unwrap().len(), 1);
/// # });
/// ```
#[derive(Debug)]
pub struct MemoryStorage<T, E, X> {
    records: Arc<RwLock<Vec<Record<T, E, X>>>>,
}

impl<T, E, X> MemoryStorage<T, E, X> {
    /// Creates empty storage.
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Creates storage pre-seeded with `records`.
    pub fn with_records(records: Vec<Record<T, E, X>>) -> Self {
        Self {
            records: Arc::new(RwLock::new(records)),
        }
    }

    /// Number of records currently "persisted".
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns `true` if nothing is persisted.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl<T, E, X> Default for MemoryStorage<T, E, X> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E, X> Clone for MemoryStorage<T, E, X> {
    fn clone(&self) -> Self {
        Self {
            records: Arc::clone(&self.records),
        }
    }
}

#[async_trait]
impl<T, E, X> Storage<T, E, X> for MemoryStorage<T, E, X>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
    X: Clone + Send + Sync + 'static,
{
    async fn load(&self) -> Result<Vec<Record<T, E, X>>, CacheError> {
        Ok(self.records.read().clone())
    }

    fn load_sync(&self) -> Result<Vec<Record<T, E, X>>, CacheError> {
        Ok(self.records.read().clone())
    }

    async fn save(&self, records: Vec<Record<T, E, X>>) -> Result<(), CacheError> {
        *self.records.write() = records;
        Ok(())
    }

    fn save_sync(&self, records: Vec<Record<T, E, X>>) -> Result<(), CacheError> {
        *self.records.write() = records;
        Ok(())
    }
}
