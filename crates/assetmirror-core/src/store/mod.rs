//! Persistent stores backing the mirror.
//!
//! Two stores are kept per scope:
//! - the index store: asset path → last synchronized digest, plus one sentinel
//!   record holding the digest of the last synchronized manifest
//! - the blob cache: asset path → cached response
//!
//! Backends implement `StoreProvider`. `Stores` binds a provider to a scope's
//! storage names and hands out index handles that are released on drop.

pub mod file;
pub mod memory;

use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::manifest::AssetManifest;
use crate::net::AssetResponse;

pub use file::FileStoreProvider;
pub use memory::MemoryStoreProvider;

/// Reserved index key holding the last synchronized manifest digest.
/// Asset paths always start with `./`, so this can never collide with one.
pub const SENTINEL_PATH: &str = "#manifest";

/// Prefix shared by all store names
const STORAGE_PREFIX: &str = "assetmirror";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stored data is corrupt: {0}")]
    Corrupt(String),

    #[error("Failed to encode stored data: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub path: String,
    pub digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
}

impl IndexRecord {
    pub fn new(path: impl Into<String>, digest: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            digest: digest.into(),
            last_modified: None,
        }
    }

    /// The sentinel record for a fully synchronized manifest
    pub fn sentinel(manifest: &AssetManifest) -> Self {
        Self {
            path: SENTINEL_PATH.to_string(),
            digest: manifest.digest.clone(),
            last_modified: manifest.last_modified.clone(),
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.path == SENTINEL_PATH
    }
}

/// Names of the two stores belonging to one scope.
///
/// Every party that touches the stores (the toggle tearing them down, the
/// coordinator filling them) must derive them from the same scope path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageNames {
    pub index: String,
    pub blobs: String,
}

impl StorageNames {
    pub fn for_scope_path(scope_path: &str) -> Self {
        Self {
            index: format!("{}-index:{}", STORAGE_PREFIX, scope_path),
            blobs: format!("{}-blobs:{}", STORAGE_PREFIX, scope_path),
        }
    }
}

/// Filesystem-safe key for an arbitrary string
pub(crate) fn hashed_name(name: &str) -> String {
    hex::encode(Sha256::digest(name.as_bytes()))
}

#[async_trait]
pub trait IndexStore: Send + Sync {
    async fn get(&self, path: &str) -> StoreResult<Option<IndexRecord>>;
    async fn put(&self, record: IndexRecord) -> StoreResult<()>;
    async fn delete(&self, path: &str) -> StoreResult<()>;
    async fn list_keys(&self) -> StoreResult<Vec<String>>;
    async fn clear(&self) -> StoreResult<()>;
}

#[async_trait]
pub trait BlobCache: Send + Sync {
    async fn has(&self, path: &str) -> StoreResult<bool>;
    async fn put(&self, path: &str, response: &AssetResponse) -> StoreResult<()>;
    async fn get(&self, path: &str) -> StoreResult<Option<AssetResponse>>;
    async fn delete(&self, path: &str) -> StoreResult<()>;
    async fn list_entries(&self) -> StoreResult<Vec<String>>;
}

/// A storage backend. Stores are created lazily on first open and live until
/// explicitly deleted.
#[async_trait]
pub trait StoreProvider: Send + Sync {
    async fn open_index(&self, name: &str) -> StoreResult<Arc<dyn IndexStore>>;
    async fn open_blobs(&self, name: &str) -> StoreResult<Arc<dyn BlobCache>>;
    async fn delete_index(&self, name: &str) -> StoreResult<()>;
    async fn delete_blobs(&self, name: &str) -> StoreResult<()>;
}

/// A provider bound to one scope's store names.
#[derive(Clone)]
pub struct Stores {
    provider: Arc<dyn StoreProvider>,
    names: StorageNames,
    open_index_handles: Arc<AtomicUsize>,
}

impl Stores {
    pub fn new(provider: Arc<dyn StoreProvider>, names: StorageNames) -> Self {
        Self {
            provider,
            names,
            open_index_handles: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn names(&self) -> &StorageNames {
        &self.names
    }

    /// Acquire the index store. The handle is released when dropped.
    pub async fn index(&self) -> StoreResult<IndexHandle> {
        let store = self.provider.open_index(&self.names.index).await?;
        self.open_index_handles.fetch_add(1, Ordering::SeqCst);
        Ok(IndexHandle {
            store,
            open: Arc::clone(&self.open_index_handles),
        })
    }

    pub async fn blobs(&self) -> StoreResult<Arc<dyn BlobCache>> {
        self.provider.open_blobs(&self.names.blobs).await
    }

    /// Number of index handles currently held
    pub fn open_index_handles(&self) -> usize {
        self.open_index_handles.load(Ordering::SeqCst)
    }

    /// Delete both stores. Each deletion is attempted independently; failures
    /// are logged and returned but never stop the other.
    pub async fn destroy(&self) -> Vec<StoreError> {
        let (index, blobs) = tokio::join!(
            self.provider.delete_index(&self.names.index),
            self.provider.delete_blobs(&self.names.blobs),
        );

        let mut errors = Vec::new();
        for (name, result) in [(&self.names.index, index), (&self.names.blobs, blobs)] {
            match result {
                Ok(()) => info!(store = %name, "Store deleted"),
                Err(e) => {
                    warn!(store = %name, error = %e, "Failed to delete store");
                    errors.push(e);
                }
            }
        }
        errors
    }
}

/// Scoped access to the index store
pub struct IndexHandle {
    store: Arc<dyn IndexStore>,
    open: Arc<AtomicUsize>,
}

impl Deref for IndexHandle {
    type Target = dyn IndexStore;

    fn deref(&self) -> &Self::Target {
        self.store.as_ref()
    }
}

impl Drop for IndexHandle {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
        debug!("Index handle released");
    }
}
