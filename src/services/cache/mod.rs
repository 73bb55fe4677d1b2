pub mod file_store;

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::core::errors::CacheResult;
use crate::core::types::CacheEntry;

pub use file_store::FileCacheStore;

/// Document store holding remedies by document id (`"<label>::<lang>"`).
///
/// `get` returns the raw document so callers can reject malformed content
/// instead of failing the whole lookup.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<serde_json::Value>>;

    async fn put(&self, key: &str, entry: &CacheEntry) -> CacheResult<()>;

    /// Number of documents currently held
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Unbounded in-process store
#[derive(Default)]
pub struct MemoryCacheStore {
    documents: RwLock<HashMap<String, serde_json::Value>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a raw document, bypassing `CacheEntry` serialization
    pub fn insert_raw(&self, key: impl Into<String>, document: serde_json::Value) {
        self.documents.write().insert(key.into(), document);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.documents.read().contains_key(key)
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> CacheResult<Option<serde_json::Value>> {
        Ok(self.documents.read().get(key).cloned())
    }

    async fn put(&self, key: &str, entry: &CacheEntry) -> CacheResult<()> {
        let document = serde_json::to_value(entry)?;
        self.documents.write().insert(key.to_string(), document);
        Ok(())
    }

    fn len(&self) -> usize {
        self.documents.read().len()
    }
}

/// Store used when caching is disabled: every lookup misses
#[derive(Debug, Default)]
pub struct NoopCacheStore;

#[async_trait]
impl CacheStore for NoopCacheStore {
    async fn get(&self, _key: &str) -> CacheResult<Option<serde_json::Value>> {
        Ok(None)
    }

    async fn put(&self, _key: &str, _entry: &CacheEntry) -> CacheResult<()> {
        Ok(())
    }

    fn len(&self) -> usize {
        0
    }
}
