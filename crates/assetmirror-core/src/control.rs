//! Offline mode toggle.
//!
//! Enabling builds the coordinator and interceptor for the configured scope and
//! schedules the initial synchronization. Disabling detaches the interceptor,
//! waits for any in-flight refresh and destroys both stores. Both directions
//! derive store names from the same scope, so a disable always finds what an
//! earlier enable created.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::Config;
use crate::intercept::RequestInterceptor;
use crate::net::{HttpTransport, Transport};
use crate::scope::Scope;
use crate::store::{FileStoreProvider, StoreProvider, Stores};
use crate::sync::{SyncCoordinator, SyncOptions};

pub struct OfflineToggle {
    scope: Scope,
    options: SyncOptions,
    transport: Arc<dyn Transport>,
    provider: Arc<dyn StoreProvider>,
    active: Option<Arc<RequestInterceptor>>,
}

impl OfflineToggle {
    pub fn new(
        scope: Scope,
        options: SyncOptions,
        transport: Arc<dyn Transport>,
        provider: Arc<dyn StoreProvider>,
    ) -> Self {
        Self {
            scope,
            options,
            transport,
            provider,
            active: None,
        }
    }

    /// Toggle backed by reqwest and file stores under the configured storage root
    pub fn from_config(config: &Config) -> Result<Self> {
        let scope = config.scope()?;
        let transport =
            HttpTransport::new(config.request_timeout()).context("Failed to build HTTP client")?;
        let provider = FileStoreProvider::new(config.storage_root()?);
        Ok(Self::new(
            scope,
            config.sync_options(),
            Arc::new(transport),
            Arc::new(provider),
        ))
    }

    pub fn is_enabled(&self) -> bool {
        self.active.is_some()
    }

    /// The interceptor to route requests through while offline mode is on
    pub fn interceptor(&self) -> Option<Arc<RequestInterceptor>> {
        self.active.clone()
    }

    pub fn stores(&self) -> Stores {
        Stores::new(Arc::clone(&self.provider), self.scope.storage_names())
    }

    /// Apply a new toggle state. Repeating the current state is a no-op.
    ///
    /// Never fails: setup and teardown faults are logged.
    pub async fn on_change(&mut self, enabled: bool) {
        match (enabled, self.active.is_some()) {
            (true, false) => self.enable(),
            (false, true) => self.disable().await,
            _ => {}
        }
    }

    fn enable(&mut self) {
        let coordinator = match SyncCoordinator::new(
            self.scope.clone(),
            Arc::clone(&self.transport),
            self.stores(),
            self.options.clone(),
        ) {
            Ok(coordinator) => coordinator,
            Err(e) => {
                warn!(scope = %self.scope.base(), error = %e, "Failed to enable offline mode");
                return;
            }
        };

        info!(scope = %self.scope.base(), "Offline mode enabled");
        // Initial synchronization runs detached
        let _ = coordinator.start_refresh(None);
        self.active = Some(Arc::new(RequestInterceptor::new(coordinator)));
    }

    async fn disable(&mut self) {
        let Some(interceptor) = self.active.take() else {
            return;
        };
        interceptor.coordinator().wait_idle().await;

        let errors = interceptor.coordinator().stores().destroy().await;
        if errors.is_empty() {
            info!(scope = %self.scope.base(), "Offline mode disabled");
        } else {
            warn!(
                scope = %self.scope.base(),
                failures = errors.len(),
                "Offline mode disabled, some stores could not be deleted"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::ResponseSource;
    use crate::store::{MemoryStoreProvider, SENTINEL_PATH};
    use crate::testing::{manifest_body, request, scope, url, MockTransport};
    use tempfile::TempDir;

    fn toggle() -> (OfflineToggle, Arc<MockTransport>, Arc<MemoryStoreProvider>) {
        let transport = Arc::new(MockTransport::new());
        let provider = Arc::new(MemoryStoreProvider::new());
        transport.serve(&url("./a.js"), "a");
        transport.serve_manifest(&manifest_body(&[("./a.js", "h1")]), None);
        let toggle = OfflineToggle::new(
            scope(),
            SyncOptions::default(),
            transport.clone(),
            provider.clone(),
        );
        (toggle, transport, provider)
    }

    #[tokio::test]
    async fn test_enable_schedules_initial_sync() {
        let (mut toggle, _transport, _provider) = toggle();

        toggle.on_change(true).await;
        let interceptor = toggle.interceptor().unwrap();
        interceptor.coordinator().wait_idle().await;

        let response = interceptor.handle(request("./a.js")).await.unwrap();
        assert_eq!(response.source, ResponseSource::Cache);
        assert!(toggle.is_enabled());
    }

    #[tokio::test]
    async fn test_disable_destroys_stores() {
        let (mut toggle, _transport, provider) = toggle();
        let names = scope().storage_names();

        toggle.on_change(true).await;
        toggle.on_change(false).await;

        assert!(!toggle.is_enabled());
        assert!(toggle.interceptor().is_none());
        assert!(!provider.exists(&names.index).await);
        assert!(!provider.exists(&names.blobs).await);
    }

    #[tokio::test]
    async fn test_disable_waits_for_in_flight_refresh() {
        let (mut toggle, transport, provider) = toggle();
        let gate = transport.gate(&url("./a.js"));

        toggle.on_change(true).await;
        let coordinator = toggle.interceptor().unwrap().coordinator().clone();
        assert!(coordinator.is_refreshing());
        gate.add_permits(1);
        toggle.on_change(false).await;

        // The cycle finished before the stores were deleted, so nothing it
        // wrote survives the teardown
        assert!(!coordinator.is_refreshing());
        assert!(!provider.exists(&scope().storage_names().index).await);
    }

    #[tokio::test]
    async fn test_repeated_state_is_noop() {
        let (mut toggle, transport, _provider) = toggle();

        toggle.on_change(false).await;
        toggle.on_change(true).await;
        let first = toggle.interceptor().unwrap();
        first.coordinator().wait_idle().await;
        toggle.on_change(true).await;

        assert!(Arc::ptr_eq(&first, &toggle.interceptor().unwrap()));
        assert_eq!(transport.hits(&url("./a.js")), 1);
    }

    #[tokio::test]
    async fn test_file_backed_toggle_round_trip() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::new());
        transport.serve(&url("./a.js"), "a");
        transport.serve_manifest(&manifest_body(&[("./a.js", "h1")]), None);
        let mut toggle = OfflineToggle::new(
            scope(),
            SyncOptions::default(),
            transport,
            Arc::new(FileStoreProvider::new(dir.path().to_path_buf())),
        );

        toggle.on_change(true).await;
        toggle.interceptor().unwrap().coordinator().wait_idle().await;
        let index = toggle.stores().index().await.unwrap();
        assert!(index.get(SENTINEL_PATH).await.unwrap().is_some());
        drop(index);

        toggle.on_change(false).await;
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_from_config() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::new("https://example.test/app");
        config.storage_dir = Some(dir.path().to_path_buf());

        let toggle = OfflineToggle::from_config(&config).unwrap();

        assert!(!toggle.is_enabled());
        assert_eq!(toggle.stores().names(), &scope().storage_names());
    }
}
