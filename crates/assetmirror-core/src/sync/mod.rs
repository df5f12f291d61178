//! Manifest-driven synchronization of the local stores.
//!
//! The `SyncCoordinator` diffs the remote manifest against the index store,
//! fetches changed assets into the blob cache and evicts what the manifest no
//! longer lists. At most one refresh cycle runs at a time; callers arriving
//! while a cycle is in flight share its outcome.

pub mod coordinator;

use chrono::{DateTime, Utc};

pub use coordinator::SyncCoordinator;

/// Default manifest file name, relative to the scope root
pub const DEFAULT_MANIFEST_NAME: &str = "sha256sums.txt";

/// Default navigation document
pub const DEFAULT_ROOT_DOCUMENT: &str = "index.html";

/// Maximum concurrent asset fetches within one refresh cycle.
const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    pub manifest_name: String,
    pub root_document: String,
    pub max_concurrent_fetches: usize,
    /// Reject fetched bodies whose SHA-256 disagrees with the manifest digest
    pub verify_digests: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            manifest_name: DEFAULT_MANIFEST_NAME.to_string(),
            root_document: DEFAULT_ROOT_DOCUMENT.to_string(),
            max_concurrent_fetches: DEFAULT_MAX_CONCURRENT_FETCHES,
            verify_digests: false,
        }
    }
}

/// Counters for one completed refresh cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshReport {
    pub manifest_digest: String,
    pub fetched: usize,
    pub unchanged: usize,
    pub failed: usize,
    /// Index records removed, either orphaned or no longer listed
    pub pruned: usize,
    /// Blob cache entries removed
    pub evicted: usize,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Completed(RefreshReport),
    /// No manifest could be obtained; nothing was touched
    NoManifest,
    /// The cycle could not start (a store failed to open) or was aborted
    Failed(String),
}

impl RefreshOutcome {
    pub fn report(&self) -> Option<&RefreshReport> {
        match self {
            RefreshOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }
}
