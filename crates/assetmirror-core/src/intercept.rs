//! Per-request serving decisions.
//!
//! For each request inside the scope the interceptor picks one of:
//! - network, while a refresh is rewriting the stores
//! - network plus a background refresh, when the entry point discovers a new
//!   manifest
//! - the blob cache, falling back to the network on a miss
//!
//! The interceptor only reads the stores; populating them is the
//! coordinator's job alone.

use tracing::{debug, info, warn};

use crate::net::{AssetRequest, AssetResponse, FetchError};
use crate::scope::SCOPE_ROOT;
use crate::store::SENTINEL_PATH;
use crate::sync::SyncCoordinator;

pub struct RequestInterceptor {
    coordinator: SyncCoordinator,
    entry_document: String,
}

impl RequestInterceptor {
    pub fn new(coordinator: SyncCoordinator) -> Self {
        let entry_document = format!("{}{}", SCOPE_ROOT, coordinator.options().root_document);
        Self {
            coordinator,
            entry_document,
        }
    }

    pub fn coordinator(&self) -> &SyncCoordinator {
        &self.coordinator
    }

    /// Answer one request. Only transport errors from forwarding surface;
    /// cache and manifest faults fall back to the network.
    pub async fn handle(&self, request: AssetRequest) -> Result<AssetResponse, FetchError> {
        let Some(path) = self.cacheable_path(&request) else {
            return self.forward(request).await;
        };

        if self.coordinator.is_refreshing() {
            debug!(path = %path, "Refresh in flight, bypassing cache");
            return self.forward(request).await;
        }

        if self.is_entry_point(&path) {
            if self.check_for_update().await {
                return self.forward(request).await;
            }
            // A refresh may have started while the manifest was in flight
            if self.coordinator.is_refreshing() {
                debug!(path = %path, "Refresh started during update check, bypassing cache");
                return self.forward(request).await;
            }
        }

        match self.cached(&path).await {
            Some(response) => {
                debug!(path = %path, "Serving from cache");
                Ok(response)
            }
            None => self.forward(request).await,
        }
    }

    /// Scope-relative path for requests the cache may answer
    fn cacheable_path(&self, request: &AssetRequest) -> Option<String> {
        if request.method != reqwest::Method::GET || request.url.query().is_some() {
            return None;
        }
        self.coordinator.scope().relative_path(&request.url)
    }

    fn is_entry_point(&self, path: &str) -> bool {
        path == SCOPE_ROOT || path == self.entry_document
    }

    /// Compare the remote manifest with the last synchronized one. On a change,
    /// start a refresh in the background and report `true`.
    async fn check_for_update(&self) -> bool {
        let sentinel = match self.coordinator.stores().index().await {
            Ok(index) => index.get(SENTINEL_PATH).await,
            Err(e) => Err(e),
        };
        let sentinel = match sentinel {
            Ok(sentinel) => sentinel,
            Err(e) => {
                warn!(error = %e, "Failed to read synchronized manifest, skipping update check");
                return false;
            }
        };

        let last_modified = sentinel.as_ref().and_then(|s| s.last_modified.as_deref());
        let Some(manifest) = self.coordinator.fetcher().fetch_manifest(last_modified).await else {
            return false;
        };
        if sentinel.is_some_and(|s| s.digest == manifest.digest) {
            return false;
        }

        info!(digest = %manifest.digest, "Manifest changed, refreshing in the background");
        // Dropping the handle does not cancel the cycle
        let _ = self.coordinator.start_refresh(Some(manifest));
        true
    }

    async fn cached(&self, path: &str) -> Option<AssetResponse> {
        let blobs = match self.coordinator.stores().blobs().await {
            Ok(blobs) => blobs,
            Err(e) => {
                warn!(error = %e, "Failed to open cache");
                return None;
            }
        };
        match blobs.get(path).await {
            Ok(response) => response,
            Err(e) => {
                warn!(path = %path, error = %e, "Failed to read cache entry");
                None
            }
        }
    }

    async fn forward(&self, request: AssetRequest) -> Result<AssetResponse, FetchError> {
        self.coordinator.transport().send(request).await
    }
}
