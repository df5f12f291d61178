//! Filesystem store backends.
//!
//! Layout under the provider root, one directory per store named by the hash
//! of the store name:
//!
//! ```text
//! <root>/<sha256(index name)>/index.json
//! <root>/<sha256(index name)>/index.log
//! <root>/<sha256(blobs name)>/<sha256(path)>.body
//! <root>/<sha256(blobs name)>/<sha256(path)>.json
//! ```
//!
//! Snapshots and blob files go to a temporary file first and are renamed into
//! place, so a crash never leaves a half-written record behind. Index
//! mutations are appended to a journal and folded into the snapshot once the
//! journal outgrows it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{hashed_name, BlobCache, IndexRecord, IndexStore, StoreError, StoreProvider, StoreResult};
use crate::net::{AssetResponse, ResponseSource};

/// Index snapshot file name inside an index store directory
const INDEX_FILE: &str = "index.json";

/// Index mutations appended since the last snapshot
const JOURNAL_FILE: &str = "index.log";

/// Journal lines allowed beyond the record count before compacting
const JOURNAL_SLACK: usize = 64;

const BODY_EXTENSION: &str = "body";
const META_EXTENSION: &str = "json";
const TMP_EXTENSION: &str = "tmp";

async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut tmp = OsString::from(path.as_os_str());
    tmp.push(".");
    tmp.push(TMP_EXTENSION);
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, contents).await?;
    fs::rename(&tmp, path).await
}

async fn remove_file_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

async fn remove_dir_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

// ============================================================================
// Index Store
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum JournalEntry {
    Put { record: IndexRecord },
    Delete { path: String },
}

#[derive(Default)]
struct IndexState {
    records: BTreeMap<String, IndexRecord>,
    journal_len: usize,
}

impl IndexState {
    fn apply(&mut self, entry: JournalEntry) {
        match entry {
            JournalEntry::Put { record } => {
                self.records.insert(record.path.clone(), record);
            }
            JournalEntry::Delete { path } => {
                self.records.remove(&path);
            }
        }
    }
}

/// Index records held in memory, backed by a JSON snapshot plus an
/// append-only journal of later mutations.
pub struct FileIndexStore {
    snapshot: PathBuf,
    journal: PathBuf,
    /// `None` until the first successful load
    state: Mutex<Option<IndexState>>,
}

impl FileIndexStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            snapshot: dir.join(INDEX_FILE),
            journal: dir.join(JOURNAL_FILE),
            state: Mutex::new(None),
        }
    }

    fn corrupt(file: &Path, e: impl std::fmt::Display) -> StoreError {
        StoreError::Corrupt(format!("{}: {}", file.display(), e))
    }

    async fn load(&self) -> StoreResult<IndexState> {
        let mut state = IndexState::default();
        match fs::read(&self.snapshot).await {
            Ok(bytes) => {
                state.records =
                    serde_json::from_slice(&bytes).map_err(|e| Self::corrupt(&self.snapshot, e))?;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let journal = match fs::read(&self.journal).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(state),
            Err(e) => return Err(e.into()),
        };
        let text = String::from_utf8_lossy(&journal);
        let lines: Vec<&str> = text.lines().filter(|l| !l.is_empty()).collect();
        let mut torn = false;
        for (i, line) in lines.iter().enumerate() {
            match serde_json::from_str::<JournalEntry>(line) {
                Ok(entry) => {
                    state.apply(entry);
                    state.journal_len += 1;
                }
                // An interrupted append leaves a partial last line
                Err(_) if i + 1 == lines.len() && !text.ends_with('\n') => torn = true,
                Err(e) => return Err(Self::corrupt(&self.journal, e)),
            }
        }

        if torn {
            warn!(file = %self.journal.display(), "Discarding incomplete journal entry");
            self.compact(&mut state).await?;
        }
        Ok(state)
    }

    /// The loaded state. A failed load leaves the slot empty, so the error
    /// repeats until `clear` replaces the files.
    async fn loaded<'a>(&self, slot: &'a mut Option<IndexState>) -> StoreResult<&'a mut IndexState> {
        let state = match slot.take() {
            Some(state) => state,
            None => self.load().await?,
        };
        Ok(slot.insert(state))
    }

    async fn compact(&self, state: &mut IndexState) -> StoreResult<()> {
        let contents = serde_json::to_vec_pretty(&state.records)?;
        write_atomic(&self.snapshot, &contents).await?;
        remove_file_if_exists(&self.journal).await?;
        debug!(file = %self.snapshot.display(), records = state.records.len(), "Index compacted");
        state.journal_len = 0;
        Ok(())
    }

    /// Persist one mutation, then apply it in memory
    async fn commit(&self, state: &mut IndexState, entry: JournalEntry) -> StoreResult<()> {
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.journal)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;

        state.apply(entry);
        state.journal_len += 1;
        if state.journal_len > state.records.len() + JOURNAL_SLACK {
            self.compact(state).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl IndexStore for FileIndexStore {
    async fn get(&self, path: &str) -> StoreResult<Option<IndexRecord>> {
        let mut slot = self.state.lock().await;
        Ok(self.loaded(&mut slot).await?.records.get(path).cloned())
    }

    async fn put(&self, record: IndexRecord) -> StoreResult<()> {
        let mut slot = self.state.lock().await;
        let state = self.loaded(&mut slot).await?;
        if state.records.get(&record.path) == Some(&record) {
            return Ok(());
        }
        self.commit(state, JournalEntry::Put { record }).await
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        let mut slot = self.state.lock().await;
        let state = self.loaded(&mut slot).await?;
        if !state.records.contains_key(path) {
            return Ok(());
        }
        self.commit(state, JournalEntry::Delete { path: path.to_string() }).await
    }

    async fn list_keys(&self) -> StoreResult<Vec<String>> {
        let mut slot = self.state.lock().await;
        Ok(self.loaded(&mut slot).await?.records.keys().cloned().collect())
    }

    async fn clear(&self) -> StoreResult<()> {
        let mut slot = self.state.lock().await;
        let mut state = IndexState::default();
        self.compact(&mut state).await?;
        *slot = Some(state);
        Ok(())
    }
}

// ============================================================================
// Blob Cache
// ============================================================================

/// Sidecar stored next to each cached body
#[derive(Debug, Serialize, Deserialize)]
struct BlobMeta {
    path: String,
    status: u16,
    #[serde(default)]
    headers: Vec<(String, String)>,
    cached_at: DateTime<Utc>,
}

impl BlobMeta {
    fn new(path: &str, response: &AssetResponse) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        Self {
            path: path.to_string(),
            status: response.status.as_u16(),
            headers,
            cached_at: Utc::now(),
        }
    }

    fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in &self.headers {
            match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                (Ok(name), Ok(value)) => {
                    map.append(name, value);
                }
                _ => debug!(header = %name, "Skipping unreadable cached header"),
            }
        }
        map
    }
}

/// One body file plus one metadata sidecar per cached path.
pub struct FileBlobCache {
    dir: PathBuf,
}

impl FileBlobCache {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn entry_file(&self, path: &str, extension: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", hashed_name(path), extension))
    }

    async fn read_meta(file: &Path) -> StoreResult<Option<BlobMeta>> {
        match fs::read(file).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Corrupt(format!("{}: {}", file.display(), e))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl BlobCache for FileBlobCache {
    async fn has(&self, path: &str) -> StoreResult<bool> {
        let meta = fs::try_exists(self.entry_file(path, META_EXTENSION)).await?;
        let body = fs::try_exists(self.entry_file(path, BODY_EXTENSION)).await?;
        Ok(meta && body)
    }

    async fn put(&self, path: &str, response: &AssetResponse) -> StoreResult<()> {
        let meta = serde_json::to_vec_pretty(&BlobMeta::new(path, response))?;
        // Body first: a sidecar never points at a missing body
        write_atomic(&self.entry_file(path, BODY_EXTENSION), &response.body).await?;
        write_atomic(&self.entry_file(path, META_EXTENSION), &meta).await?;
        Ok(())
    }

    async fn get(&self, path: &str) -> StoreResult<Option<AssetResponse>> {
        let Some(meta) = Self::read_meta(&self.entry_file(path, META_EXTENSION)).await? else {
            return Ok(None);
        };
        let body = match fs::read(self.entry_file(path, BODY_EXTENSION)).await {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let status = StatusCode::from_u16(meta.status)
            .map_err(|e| StoreError::Corrupt(format!("cached status for {:?}: {}", path, e)))?;

        Ok(Some(AssetResponse {
            status,
            headers: meta.header_map(),
            body: Bytes::from(body),
            source: ResponseSource::Cache,
        }))
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        remove_file_if_exists(&self.entry_file(path, META_EXTENSION)).await?;
        remove_file_if_exists(&self.entry_file(path, BODY_EXTENSION)).await?;
        Ok(())
    }

    /// Also sweeps leftovers of interrupted writes: temporary files, bodies
    /// without a sidecar and unreadable sidecars. Callers must not run it
    /// concurrently with `put` on the same cache.
    async fn list_entries(&self) -> StoreResult<Vec<String>> {
        let mut paths = Vec::new();
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(paths),
            Err(e) => return Err(e.into()),
        };

        let mut listed = HashSet::new();
        let mut bodies = Vec::new();
        let mut leftovers = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let file = entry.path();
            match file.extension().and_then(|e| e.to_str()) {
                Some(META_EXTENSION) => match Self::read_meta(&file).await {
                    Ok(Some(meta)) => {
                        listed.insert(file.with_extension(BODY_EXTENSION));
                        paths.push(meta.path);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        // An unreadable sidecar can never be matched to a path again
                        warn!(file = %file.display(), error = %e, "Dropping unreadable cache entry");
                        leftovers.push(file);
                    }
                },
                Some(BODY_EXTENSION) => bodies.push(file),
                Some(TMP_EXTENSION) => leftovers.push(file),
                _ => {}
            }
        }
        leftovers.extend(bodies.into_iter().filter(|body| !listed.contains(body)));

        for file in leftovers {
            match remove_file_if_exists(&file).await {
                Ok(()) => debug!(file = %file.display(), "Removed orphaned cache file"),
                Err(e) => warn!(file = %file.display(), error = %e, "Failed to remove orphaned cache file"),
            }
        }

        paths.sort();
        Ok(paths)
    }
}

// ============================================================================
// Provider
// ============================================================================

pub struct FileStoreProvider {
    root: PathBuf,
    indexes: Mutex<HashMap<String, Arc<FileIndexStore>>>,
    blobs: Mutex<HashMap<String, Arc<FileBlobCache>>>,
}

impl FileStoreProvider {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            indexes: Mutex::new(HashMap::new()),
            blobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn store_dir(&self, name: &str) -> PathBuf {
        self.root.join(hashed_name(name))
    }
}

#[async_trait]
impl StoreProvider for FileStoreProvider {
    async fn open_index(&self, name: &str) -> StoreResult<Arc<dyn IndexStore>> {
        let mut indexes = self.indexes.lock().await;
        let dir = self.store_dir(name);
        // Recreate the directory even for a known store: it may have been deleted
        fs::create_dir_all(&dir).await?;

        let store = indexes
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(FileIndexStore::new(&dir)));
        let store: Arc<dyn IndexStore> = Arc::clone(store) as Arc<dyn IndexStore>;
        Ok(store)
    }

    async fn open_blobs(&self, name: &str) -> StoreResult<Arc<dyn BlobCache>> {
        let mut blobs = self.blobs.lock().await;
        let dir = self.store_dir(name);
        fs::create_dir_all(&dir).await?;

        let cache = blobs
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(FileBlobCache::new(dir)));
        let cache: Arc<dyn BlobCache> = Arc::clone(cache) as Arc<dyn BlobCache>;
        Ok(cache)
    }

    async fn delete_index(&self, name: &str) -> StoreResult<()> {
        self.indexes.lock().await.remove(name);
        remove_dir_if_exists(&self.store_dir(name)).await?;
        Ok(())
    }

    async fn delete_blobs(&self, name: &str) -> StoreResult<()> {
        self.blobs.lock().await.remove(name);
        remove_dir_if_exists(&self.store_dir(name)).await?;
        Ok(())
    }
}
