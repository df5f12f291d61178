//! Asset manifest model, wire-format parser and fetcher.
//!
//! The manifest is a checksum listing, one `<digest>  <path>` entry per line,
//! served next to the assets it describes.

pub mod fetcher;
pub mod parser;

use std::collections::{HashMap, HashSet};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::scope::SCOPE_ROOT;

pub use fetcher::ManifestFetcher;
pub use parser::parse_line;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManifestError {
    #[error("Manifest line has no path delimiter: {0:?}")]
    MissingDelimiter(String),

    #[error("Manifest path has a dot segment: {0:?}")]
    DotSegment(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetEntry {
    pub path: String,
    pub digest: String,
}

impl AssetEntry {
    pub fn new(path: impl Into<String>, digest: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            digest: digest.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetManifest {
    /// Hex SHA-256 of the raw manifest payload
    pub digest: String,
    /// `Last-Modified` of the manifest response, echoed back as `If-Modified-Since`
    pub last_modified: Option<String>,
    pub entries: Vec<AssetEntry>,
}

impl AssetManifest {
    /// Decode a raw manifest payload.
    ///
    /// The digest covers the raw bytes, not the decoded text. When the listing
    /// contains `./<root_document>`, a `./` entry sharing its digest is placed
    /// first so the scope root is mirrored alongside the document.
    pub fn from_bytes(
        payload: &[u8],
        last_modified: Option<String>,
        root_document: &str,
    ) -> Result<Self, ManifestError> {
        let digest = hex::encode(Sha256::digest(payload));
        let text = String::from_utf8_lossy(payload);

        // A repeated path keeps its first position and its last digest
        let mut entries: Vec<AssetEntry> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();
        for line in text.lines().filter(|line| !line.trim().is_empty()) {
            let entry = parse_line(line)?;
            match positions.get(&entry.path) {
                Some(&i) => {
                    debug!(path = %entry.path, "Manifest lists path twice, keeping the later digest");
                    entries[i] = entry;
                }
                None => {
                    positions.insert(entry.path.clone(), entries.len());
                    entries.push(entry);
                }
            }
        }

        let document = parser::normalize_path(root_document);
        let root_digest = entries
            .iter()
            .find(|e| e.path == document)
            .map(|e| e.digest.clone());
        if let Some(root_digest) = root_digest {
            if !entries.iter().any(|e| e.path == SCOPE_ROOT) {
                entries.insert(0, AssetEntry::new(SCOPE_ROOT, root_digest));
            }
        }

        Ok(Self {
            digest,
            last_modified,
            entries,
        })
    }

    /// The set of paths this manifest keeps alive
    pub fn paths(&self) -> HashSet<&str> {
        self.entries.iter().map(|e| e.path.as_str()).collect()
    }
}
