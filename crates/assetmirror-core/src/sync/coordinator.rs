//! Single-flight refresh cycles.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use futures::stream::{self, StreamExt};
use reqwest::header::{self, HeaderValue};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use super::{RefreshOutcome, RefreshReport, SyncOptions};
use crate::manifest::{AssetEntry, AssetManifest, ManifestFetcher};
use crate::net::{AssetRequest, AssetResponse, FetchError, Transport};
use crate::scope::Scope;
use crate::store::{BlobCache, IndexRecord, IndexStore, Stores, SENTINEL_PATH};

/// A refresh cycle that can be awaited by any number of callers.
/// The cycle itself runs on its own task and completes even if every
/// handle is dropped.
pub type RefreshHandle = Shared<BoxFuture<'static, RefreshOutcome>>;

/// Clone is cheap - all state is behind one Arc.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    scope: Scope,
    transport: Arc<dyn Transport>,
    fetcher: ManifestFetcher,
    stores: Stores,
    options: SyncOptions,
    in_flight: Mutex<Option<RefreshHandle>>,
}

/// Per-entry result within one cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntrySync {
    Unchanged,
    Fetched,
    Failed,
}

/// Clears the in-flight slot when a cycle ends, including by panic
struct ClearInFlight(Arc<Inner>);

impl Drop for ClearInFlight {
    fn drop(&mut self) {
        self.0.lock_in_flight().take();
    }
}

impl SyncCoordinator {
    pub fn new(
        scope: Scope,
        transport: Arc<dyn Transport>,
        stores: Stores,
        options: SyncOptions,
    ) -> Result<Self, url::ParseError> {
        let fetcher = ManifestFetcher::new(
            Arc::clone(&transport),
            &scope,
            &options.manifest_name,
            options.root_document.clone(),
        )?;

        Ok(Self {
            inner: Arc::new(Inner {
                scope,
                transport,
                fetcher,
                stores,
                options,
                in_flight: Mutex::new(None),
            }),
        })
    }

    pub fn scope(&self) -> &Scope {
        &self.inner.scope
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub fn fetcher(&self) -> &ManifestFetcher {
        &self.inner.fetcher
    }

    pub fn stores(&self) -> &Stores {
        &self.inner.stores
    }

    pub fn options(&self) -> &SyncOptions {
        &self.inner.options
    }

    /// Run a refresh cycle, or join the one already in flight.
    ///
    /// When `manifest` is `None` the cycle fetches it unconditionally.
    pub async fn refresh(&self, manifest: Option<AssetManifest>) -> RefreshOutcome {
        self.start_refresh(manifest).await
    }

    /// Launch a refresh cycle without waiting for it.
    ///
    /// If a cycle is already in flight, its handle is returned and `manifest`
    /// is discarded. Must be called from within a Tokio runtime.
    pub fn start_refresh(&self, manifest: Option<AssetManifest>) -> RefreshHandle {
        let mut slot = self.inner.lock_in_flight();
        if let Some(handle) = slot.as_ref() {
            debug!("Refresh already in flight, joining it");
            return handle.clone();
        }

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let _clear = ClearInFlight(Arc::clone(&inner));
            inner.run_cycle(manifest).await
        });

        let handle = task
            .map(|joined| {
                joined.unwrap_or_else(|e| {
                    error!(error = %e, "Refresh task aborted");
                    RefreshOutcome::Failed(format!("refresh task aborted: {}", e))
                })
            })
            .boxed()
            .shared();

        *slot = Some(handle.clone());
        handle
    }

    /// Whether a refresh cycle is currently rewriting the stores
    pub fn is_refreshing(&self) -> bool {
        self.inner.lock_in_flight().is_some()
    }

    /// Wait for the in-flight cycle, if any, to finish
    pub async fn wait_idle(&self) {
        let handle = self.inner.lock_in_flight().clone();
        if let Some(handle) = handle {
            handle.await;
        }
    }
}

impl Inner {
    fn lock_in_flight(&self) -> MutexGuard<'_, Option<RefreshHandle>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_cycle(&self, supplied: Option<AssetManifest>) -> RefreshOutcome {
        info!("Refresh cycle started");

        let manifest = async {
            match supplied {
                Some(manifest) => Some(manifest),
                None => self.fetcher.fetch_manifest(None).await,
            }
        };
        let (manifest, blobs, index) =
            tokio::join!(manifest, self.stores.blobs(), self.stores.index());

        let Some(manifest) = manifest else {
            info!("No manifest available, leaving stores untouched");
            return RefreshOutcome::NoManifest;
        };
        let (blobs, index) = match (blobs, index) {
            (Ok(blobs), Ok(index)) => (blobs, index),
            (Err(e), _) | (_, Err(e)) => {
                error!(error = %e, "Failed to open stores, skipping refresh");
                return RefreshOutcome::Failed(e.to_string());
            }
        };
        let blobs = blobs.as_ref();

        let mut pruned = self.prune_orphaned_records(&*index, blobs).await;

        let results = self.sync_entries(&*index, blobs, &manifest).await;
        let count = |kind: EntrySync| results.iter().filter(|r| **r == kind).count();

        let live = manifest.paths();
        pruned += self.prune_unlisted_records(&*index, &live).await;
        let evicted = self.evict_unlisted_blobs(blobs, &live).await;

        if let Err(e) = index.put(IndexRecord::sentinel(&manifest)).await {
            error!(error = %e, "Failed to record synchronized manifest");
        }
        drop(index);

        let report = RefreshReport {
            manifest_digest: manifest.digest.clone(),
            fetched: count(EntrySync::Fetched),
            unchanged: count(EntrySync::Unchanged),
            failed: count(EntrySync::Failed),
            pruned,
            evicted,
            completed_at: Utc::now(),
        };
        info!(
            digest = %report.manifest_digest,
            fetched = report.fetched,
            unchanged = report.unchanged,
            failed = report.failed,
            pruned = report.pruned,
            evicted = report.evicted,
            "Refresh cycle complete"
        );
        RefreshOutcome::Completed(report)
    }

    /// Asset paths recorded in the index. An unreadable index is cleared and
    /// treated as empty, which forces a full resynchronization.
    async fn record_paths(&self, index: &dyn IndexStore) -> Vec<String> {
        match index.list_keys().await {
            Ok(keys) => keys.into_iter().filter(|k| k != SENTINEL_PATH).collect(),
            Err(e) => {
                error!(error = %e, "Index unreadable, clearing it for a full resync");
                if let Err(e) = index.clear().await {
                    error!(error = %e, "Failed to clear index");
                }
                Vec::new()
            }
        }
    }

    /// Drop index records whose body is gone from the blob cache
    async fn prune_orphaned_records(&self, index: &dyn IndexStore, blobs: &dyn BlobCache) -> usize {
        let paths = self.record_paths(index).await;

        let removed = join_all(paths.iter().map(|path| async move {
            match blobs.has(path).await {
                Ok(true) => false,
                Ok(false) => match index.delete(path).await {
                    Ok(()) => {
                        debug!(path = %path, "Pruned index record with no cached body");
                        true
                    }
                    Err(e) => {
                        warn!(path = %path, error = %e, "Failed to prune index record");
                        false
                    }
                },
                Err(e) => {
                    warn!(path = %path, error = %e, "Failed to check cache entry");
                    false
                }
            }
        }))
        .await;

        removed.into_iter().filter(|r| *r).count()
    }

    async fn sync_entries(
        &self,
        index: &dyn IndexStore,
        blobs: &dyn BlobCache,
        manifest: &AssetManifest,
    ) -> Vec<EntrySync> {
        let syncs: Vec<_> = manifest
            .entries
            .iter()
            .map(|entry| self.sync_entry(index, blobs, entry))
            .collect();

        stream::iter(syncs)
            .buffer_unordered(self.options.max_concurrent_fetches.max(1))
            .collect::<Vec<_>>()
            .await
    }

    async fn sync_entry(
        &self,
        index: &dyn IndexStore,
        blobs: &dyn BlobCache,
        entry: &AssetEntry,
    ) -> EntrySync {
        match index.get(&entry.path).await {
            Ok(Some(record)) if record.digest == entry.digest => return EntrySync::Unchanged,
            Ok(_) => {}
            Err(e) => warn!(path = %entry.path, error = %e, "Failed to read index record, refetching"),
        }

        let response = match self.fetch_asset(entry).await {
            Ok(response) => response,
            Err(e) => {
                warn!(path = %entry.path, error = %e, "Failed to fetch asset");
                return EntrySync::Failed;
            }
        };
        if let Err(e) = blobs.put(&entry.path, &response).await {
            warn!(path = %entry.path, error = %e, "Failed to cache asset");
            return EntrySync::Failed;
        }
        if let Err(e) = index.put(IndexRecord::new(&entry.path, &entry.digest)).await {
            warn!(path = %entry.path, error = %e, "Failed to record asset digest");
            return EntrySync::Failed;
        }

        debug!(path = %entry.path, digest = %entry.digest, "Asset cached");
        EntrySync::Fetched
    }

    async fn fetch_asset(&self, entry: &AssetEntry) -> Result<AssetResponse, FetchError> {
        let url = self.scope.resolve(&entry.path)?;
        let request = AssetRequest::get(url)
            .with_header(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        let response = self.transport.send(request).await?;

        if !response.is_success() {
            return Err(FetchError::from_status(response.status, &response.text_lossy()));
        }
        if self.options.verify_digests {
            verify_digest(entry, &response.body)?;
        }
        Ok(response)
    }

    /// Drop index records for paths the manifest no longer lists
    async fn prune_unlisted_records(&self, index: &dyn IndexStore, live: &HashSet<&str>) -> usize {
        let stale: Vec<String> = self
            .record_paths(index)
            .await
            .into_iter()
            .filter(|path| !live.contains(path.as_str()))
            .collect();

        let removed = join_all(stale.iter().map(|path| async move {
            match index.delete(path).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(path = %path, error = %e, "Failed to delete unlisted index record");
                    false
                }
            }
        }))
        .await;

        removed.into_iter().filter(|r| *r).count()
    }

    /// Delete every cached body the manifest no longer lists, whether or not
    /// the index knows about it
    async fn evict_unlisted_blobs(&self, blobs: &dyn BlobCache, live: &HashSet<&str>) -> usize {
        let entries = match blobs.list_entries().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Failed to list cache entries, skipping eviction");
                return 0;
            }
        };

        let stale: Vec<String> = entries
            .into_iter()
            .filter(|path| !live.contains(path.as_str()))
            .collect();

        let evicted = join_all(stale.iter().map(|path| async move {
            match blobs.delete(path).await {
                Ok(()) => {
                    debug!(path = %path, "Evicted cache entry");
                    true
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "Failed to evict cache entry");
                    false
                }
            }
        }))
        .await;

        evicted.into_iter().filter(|r| *r).count()
    }
}

/// Compare a fetched body against a SHA-256 manifest digest. Digests in any
/// other format are opaque and accepted as-is.
fn verify_digest(entry: &AssetEntry, body: &[u8]) -> Result<(), FetchError> {
    let expected = &entry.digest;
    if expected.len() != 64 || !expected.chars().all(|c| c.is_ascii_hexdigit()) {
        debug!(path = %entry.path, "Digest is not SHA-256, skipping verification");
        return Ok(());
    }

    let actual = hex::encode(Sha256::digest(body));
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(FetchError::DigestMismatch {
            path: entry.path.clone(),
            expected: expected.clone(),
            actual,
        })
    }
}
