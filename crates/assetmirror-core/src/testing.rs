//! Shared fixtures for unit tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use url::Url;

use crate::net::{AssetRequest, AssetResponse, FetchError, Transport};
use crate::scope::Scope;
use crate::store::{IndexRecord, MemoryStoreProvider, Stores};
use crate::sync::{SyncCoordinator, SyncOptions};

pub const BASE: &str = "https://example.test/app/";
pub const MANIFEST: &str = "sha256sums.txt";

pub fn scope() -> Scope {
    Scope::parse(BASE).unwrap()
}

pub fn url(path: &str) -> String {
    scope().resolve(path).unwrap().to_string()
}

pub fn request(path: &str) -> AssetRequest {
    AssetRequest::get(Url::parse(&url(path)).unwrap())
}

/// Render a manifest payload from `(path, digest)` pairs
pub fn manifest_body(entries: &[(&str, &str)]) -> String {
    entries
        .iter()
        .map(|(path, digest)| format!("{}  {}\n", digest, path))
        .collect()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[derive(Clone)]
struct Route {
    status: StatusCode,
    body: Bytes,
    last_modified: Option<String>,
}

/// Scripted transport keyed by absolute URL.
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<HashMap<String, Route>>,
    hits: Mutex<HashMap<String, usize>>,
    requests: Mutex<HashMap<String, AssetRequest>>,
    gates: Mutex<HashMap<String, Arc<Semaphore>>>,
    offline: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, url: &str, body: impl Into<Bytes>) {
        self.routes.lock().unwrap().insert(
            url.to_string(),
            Route {
                status: StatusCode::OK,
                body: body.into(),
                last_modified: None,
            },
        );
    }

    pub fn serve_status(&self, url: &str, status: StatusCode) {
        self.routes.lock().unwrap().insert(
            url.to_string(),
            Route {
                status,
                body: Bytes::new(),
                last_modified: None,
            },
        );
    }

    pub fn serve_manifest(&self, body: &str, last_modified: Option<&str>) {
        self.routes.lock().unwrap().insert(
            url(MANIFEST),
            Route {
                status: StatusCode::OK,
                body: Bytes::from(body.to_string()),
                last_modified: last_modified.map(str::to_string),
            },
        );
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Hold every request for `url` until permits are added to the returned
    /// semaphore
    pub fn gate(&self, url: &str) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.gates.lock().unwrap().insert(url.to_string(), Arc::clone(&gate));
        gate
    }

    pub fn hits(&self, url: &str) -> usize {
        self.hits.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    /// Requests for anything but the manifest
    pub fn asset_hits(&self) -> usize {
        let manifest = url(MANIFEST);
        self.hits
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, _)| **u != manifest)
            .map(|(_, n)| n)
            .sum()
    }

    pub fn reset_hits(&self) {
        self.hits.lock().unwrap().clear();
    }

    pub fn last_request(&self, url: &str) -> Option<AssetRequest> {
        self.requests.lock().unwrap().get(url).cloned()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: AssetRequest) -> Result<AssetResponse, FetchError> {
        let key = request.url.to_string();
        *self.hits.lock().unwrap().entry(key.clone()).or_default() += 1;
        self.requests.lock().unwrap().insert(key.clone(), request.clone());

        let gate = self.gates.lock().unwrap().get(&key).cloned();
        if let Some(gate) = gate {
            let permit = gate.acquire().await.unwrap();
            permit.forget();
        }

        if self.offline.load(Ordering::SeqCst) {
            return Err(FetchError::Unavailable(key));
        }

        let route = self.routes.lock().unwrap().get(&key).cloned();
        let Some(route) = route else {
            return Ok(AssetResponse::network(StatusCode::NOT_FOUND, HeaderMap::new(), Bytes::new()));
        };

        let mut headers = HeaderMap::new();
        if let Some(lm) = &route.last_modified {
            headers.insert(header::LAST_MODIFIED, HeaderValue::from_str(lm).unwrap());
            let since = request
                .headers
                .get(header::IF_MODIFIED_SINCE)
                .and_then(|v| v.to_str().ok());
            if since == Some(lm.as_str()) {
                return Ok(AssetResponse::network(StatusCode::NOT_MODIFIED, headers, Bytes::new()));
            }
        }

        Ok(AssetResponse::network(route.status, headers, route.body))
    }
}

/// A coordinator wired to a mock transport and in-memory stores.
pub struct Harness {
    pub transport: Arc<MockTransport>,
    pub provider: Arc<MemoryStoreProvider>,
    pub stores: Stores,
    pub coordinator: SyncCoordinator,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(SyncOptions::default())
    }

    pub fn with_options(options: SyncOptions) -> Self {
        let transport = Arc::new(MockTransport::new());
        let provider = Arc::new(MemoryStoreProvider::new());
        let stores = Stores::new(provider.clone(), scope().storage_names());
        let coordinator =
            SyncCoordinator::new(scope(), transport.clone(), stores.clone(), options).unwrap();
        Self {
            transport,
            provider,
            stores,
            coordinator,
        }
    }

    /// Serve `(path, digest)` entries with bodies `body-of:<path>@<digest>`
    /// and a manifest listing them
    pub fn publish(&self, entries: &[(&str, &str)]) {
        for (path, digest) in entries {
            self.transport.serve(&url(path), format!("body-of:{}@{}", path, digest));
        }
        self.transport.serve_manifest(&manifest_body(entries), None);
    }

    pub async fn index_snapshot(&self) -> BTreeMap<String, IndexRecord> {
        let index = self.stores.index().await.unwrap();
        let mut records = BTreeMap::new();
        for key in index.list_keys().await.unwrap() {
            let record = index.get(&key).await.unwrap().unwrap();
            records.insert(key, record);
        }
        records
    }

    pub async fn blob_snapshot(&self) -> BTreeMap<String, Bytes> {
        let blobs = self.stores.blobs().await.unwrap();
        let mut bodies = BTreeMap::new();
        for path in blobs.list_entries().await.unwrap() {
            let body = blobs.get(&path).await.unwrap().unwrap().body;
            bodies.insert(path, body);
        }
        bodies
    }
}
