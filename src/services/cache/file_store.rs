use async_trait::async_trait;
use lru::LruCache;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::CacheStore;
use crate::core::errors::{CacheError, CacheResult};
use crate::core::types::CacheEntry;
use crate::utils::Metrics;

const CACHE_FILE_NAME: &str = "remedies.json";

/// Remedy document cache backed by a JSON file.
///
/// - LRU eviction bounds memory use
/// - Writes mark the cache dirty; a background task persists at most once
///   per `save_interval`
/// - The file is replaced atomically (write to temp, then rename)
#[derive(Clone)]
pub struct FileCacheStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    documents: RwLock<LruCache<String, serde_json::Value>>,
    cache_file: PathBuf,
    dirty: AtomicBool,
    save_notify: Notify,
    metrics: Option<Metrics>,
}

impl FileCacheStore {
    /// Open (or create) the cache under `cache_dir`.
    ///
    /// `save_interval` of `None` or zero disables background persistence;
    /// call [`FileCacheStore::save`] explicitly in that case.
    pub async fn open(
        cache_dir: &str,
        max_entries: usize,
        save_interval: Option<Duration>,
        metrics: Option<Metrics>,
    ) -> CacheResult<Self> {
        let cache_path = Path::new(cache_dir);
        if !cache_path.exists() {
            tokio::fs::create_dir_all(cache_path)
                .await
                .map_err(|source| CacheError::Io {
                    path: cache_dir.to_string(),
                    source,
                })?;
        }

        let cache_file = cache_path.join(CACHE_FILE_NAME);
        let capacity = NonZeroUsize::new(max_entries).ok_or_else(|| {
            CacheError::BackendUnavailable("cache capacity must be > 0".to_string())
        })?;

        let stored = if cache_file.exists() {
            let data = tokio::fs::read_to_string(&cache_file)
                .await
                .map_err(|source| CacheError::Io {
                    path: cache_file.display().to_string(),
                    source,
                })?;
            match serde_json::from_str::<HashMap<String, serde_json::Value>>(&data) {
                Ok(map) => map,
                Err(e) => {
                    warn!("Ignoring unreadable cache file {}: {}", cache_file.display(), e);
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        let mut lru = LruCache::new(capacity);
        for (key, document) in stored {
            lru.put(key, document);
        }

        info!("Remedy cache opened: {} documents from {}", lru.len(), cache_file.display());
        if let Some(ref m) = metrics {
            m.update_cache_size(lru.len());
        }

        let store = Self {
            inner: Arc::new(StoreInner {
                documents: RwLock::new(lru),
                cache_file,
                dirty: AtomicBool::new(false),
                save_notify: Notify::new(),
                metrics,
            }),
        };

        if let Some(interval) = save_interval.filter(|i| !i.is_zero()) {
            store.start_persistence_task(interval);
        }

        Ok(store)
    }

    /// Persist all documents now
    pub async fn save(&self) -> CacheResult<()> {
        persist(&self.inner).await
    }

    pub fn cache_file(&self) -> &Path {
        &self.inner.cache_file
    }

    fn start_persistence_task(&self, interval: Duration) {
        let inner = Arc::clone(&self.inner);

        tokio::spawn(async move {
            loop {
                inner.save_notify.notified().await;
                // Debounce: collect writes arriving during the interval
                tokio::time::sleep(interval).await;

                if inner.dirty.load(Ordering::Acquire) {
                    if let Err(e) = persist(&inner).await {
                        warn!("Background cache save failed: {}", e);
                    }
                }
            }
        });
    }
}

async fn persist(inner: &StoreInner) -> CacheResult<()> {
    // Writes racing this save set the flag again
    inner.dirty.store(false, Ordering::Release);
    let result = write_snapshot(inner).await;
    if result.is_err() {
        inner.dirty.store(true, Ordering::Release);
    }
    result
}

async fn write_snapshot(inner: &StoreInner) -> CacheResult<()> {
    let snapshot: HashMap<String, serde_json::Value> = {
        let documents = inner.documents.read();
        documents
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    };

    let json = serde_json::to_string_pretty(&snapshot)?;
    let tmp_file = inner.cache_file.with_extension("json.tmp");

    let io_err = |source| CacheError::Io {
        path: inner.cache_file.display().to_string(),
        source,
    };
    tokio::fs::write(&tmp_file, json).await.map_err(io_err)?;
    tokio::fs::rename(&tmp_file, &inner.cache_file)
        .await
        .map_err(io_err)?;

    debug!("Persisted {} remedy documents", snapshot.len());
    Ok(())
}

#[async_trait]
impl CacheStore for FileCacheStore {
    async fn get(&self, key: &str) -> CacheResult<Option<serde_json::Value>> {
        // LRU lookup updates recency, so it needs the write lock
        Ok(self.inner.documents.write().get(key).cloned())
    }

    async fn put(&self, key: &str, entry: &CacheEntry) -> CacheResult<()> {
        let document = serde_json::to_value(entry)?;
        {
            let mut documents = self.inner.documents.write();
            documents.put(key.to_string(), document);
            if let Some(ref m) = self.inner.metrics {
                m.update_cache_size(documents.len());
            }
        }

        self.inner.dirty.store(true, Ordering::Release);
        self.inner.save_notify.notify_one();
        Ok(())
    }

    fn len(&self) -> usize {
        self.inner.documents.read().len()
    }
}
