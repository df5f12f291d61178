//! In-memory store backends.
//!
//! Nothing survives the process; used for tests and for hosts that only want
//! the interception logic without persistence.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{BlobCache, IndexRecord, IndexStore, StoreError, StoreProvider, StoreResult};
use crate::net::{AssetResponse, ResponseSource};

#[derive(Default)]
pub struct MemoryIndexStore {
    records: Mutex<BTreeMap<String, IndexRecord>>,
    corrupted: AtomicBool,
}

impl MemoryIndexStore {
    /// Make subsequent key listings fail until the store is cleared
    pub fn mark_corrupted(&self) {
        self.corrupted.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl IndexStore for MemoryIndexStore {
    async fn get(&self, path: &str) -> StoreResult<Option<IndexRecord>> {
        Ok(self.records.lock().await.get(path).cloned())
    }

    async fn put(&self, record: IndexRecord) -> StoreResult<()> {
        self.records.lock().await.insert(record.path.clone(), record);
        Ok(())
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        self.records.lock().await.remove(path);
        Ok(())
    }

    async fn list_keys(&self) -> StoreResult<Vec<String>> {
        if self.corrupted.load(Ordering::SeqCst) {
            return Err(StoreError::Corrupt("index marked corrupted".to_string()));
        }
        Ok(self.records.lock().await.keys().cloned().collect())
    }

    async fn clear(&self) -> StoreResult<()> {
        self.records.lock().await.clear();
        self.corrupted.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryBlobCache {
    entries: Mutex<BTreeMap<String, AssetResponse>>,
}

impl MemoryBlobCache {
    /// Drop an entry behind the index's back, as a host evicting under
    /// storage pressure would
    pub async fn evict(&self, path: &str) {
        self.entries.lock().await.remove(path);
    }
}

#[async_trait]
impl BlobCache for MemoryBlobCache {
    async fn has(&self, path: &str) -> StoreResult<bool> {
        Ok(self.entries.lock().await.contains_key(path))
    }

    async fn put(&self, path: &str, response: &AssetResponse) -> StoreResult<()> {
        let mut stored = response.clone();
        stored.source = ResponseSource::Cache;
        self.entries.lock().await.insert(path.to_string(), stored);
        Ok(())
    }

    async fn get(&self, path: &str) -> StoreResult<Option<AssetResponse>> {
        Ok(self.entries.lock().await.get(path).cloned())
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        self.entries.lock().await.remove(path);
        Ok(())
    }

    async fn list_entries(&self) -> StoreResult<Vec<String>> {
        Ok(self.entries.lock().await.keys().cloned().collect())
    }
}

#[derive(Default)]
pub struct MemoryStoreProvider {
    indexes: Mutex<HashMap<String, Arc<MemoryIndexStore>>>,
    blobs: Mutex<HashMap<String, Arc<MemoryBlobCache>>>,
}

impl MemoryStoreProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a store of either kind exists under `name`
    pub async fn exists(&self, name: &str) -> bool {
        self.indexes.lock().await.contains_key(name) || self.blobs.lock().await.contains_key(name)
    }

    /// Concrete index store, created on demand
    pub async fn index_store(&self, name: &str) -> Arc<MemoryIndexStore> {
        Arc::clone(self.indexes.lock().await.entry(name.to_string()).or_default())
    }

    /// Concrete blob cache, created on demand
    pub async fn blob_cache(&self, name: &str) -> Arc<MemoryBlobCache> {
        Arc::clone(self.blobs.lock().await.entry(name.to_string()).or_default())
    }
}

#[async_trait]
impl StoreProvider for MemoryStoreProvider {
    async fn open_index(&self, name: &str) -> StoreResult<Arc<dyn IndexStore>> {
        let store: Arc<dyn IndexStore> = self.index_store(name).await;
        Ok(store)
    }

    async fn open_blobs(&self, name: &str) -> StoreResult<Arc<dyn BlobCache>> {
        let cache: Arc<dyn BlobCache> = self.blob_cache(name).await;
        Ok(cache)
    }

    async fn delete_index(&self, name: &str) -> StoreResult<()> {
        self.indexes.lock().await.remove(name);
        Ok(())
    }

    async fn delete_blobs(&self, name: &str) -> StoreResult<()> {
        self.blobs.lock().await.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use reqwest::header::HeaderMap;
    use reqwest::StatusCode;

    #[tokio::test]
    async fn test_index_crud() {
        let store = MemoryIndexStore::default();
        store.put(IndexRecord::new("./b", "2")).await.unwrap();
        store.put(IndexRecord::new("./a", "1")).await.unwrap();

        assert_eq!(store.get("./a").await.unwrap().unwrap().digest, "1");
        assert_eq!(store.list_keys().await.unwrap(), vec!["./a", "./b"]);

        store.delete("./a").await.unwrap();
        assert!(store.get("./a").await.unwrap().is_none());

        store.clear().await.unwrap();
        assert!(store.list_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corruption_cleared_by_clear() {
        let store = MemoryIndexStore::default();
        store.mark_corrupted();
        assert!(matches!(store.list_keys().await, Err(StoreError::Corrupt(_))));

        store.clear().await.unwrap();
        assert!(store.list_keys().await.is_ok());
    }

    #[tokio::test]
    async fn test_blob_put_marks_cache_source() {
        let cache = MemoryBlobCache::default();
        let response = AssetResponse::network(StatusCode::OK, HeaderMap::new(), Bytes::from_static(b"hi"));

        cache.put("./a", &response).await.unwrap();

        let cached = cache.get("./a").await.unwrap().unwrap();
        assert_eq!(cached.source, ResponseSource::Cache);
        assert_eq!(cached.body, Bytes::from_static(b"hi"));
        assert!(cache.has("./a").await.unwrap());
        assert_eq!(cache.list_entries().await.unwrap(), vec!["./a"]);
    }

    #[tokio::test]
    async fn test_provider_returns_same_store_per_name() {
        let provider = MemoryStoreProvider::new();
        provider.open_index("i").await.unwrap().put(IndexRecord::new("./a", "1")).await.unwrap();

        let reopened = provider.open_index("i").await.unwrap();
        assert!(reopened.get("./a").await.unwrap().is_some());

        provider.delete_index("i").await.unwrap();
        let fresh = provider.open_index("i").await.unwrap();
        assert!(fresh.get("./a").await.unwrap().is_none());
    }
}
