//! Mirror configuration.
//!
//! Stored as JSON. Every field except `base_url` has a default, so a minimal
//! config file is `{"base_url": "https://host/app/"}`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::scope::Scope;
use crate::sync::{SyncOptions, DEFAULT_MANIFEST_NAME, DEFAULT_ROOT_DOCUMENT};

/// Application name used for the default storage directory
pub const APP_NAME: &str = "assetmirror";

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the caching scope
    pub base_url: String,
    #[serde(default = "default_manifest_name")]
    pub manifest_name: String,
    #[serde(default = "default_root_document")]
    pub root_document: String,
    /// Where the file-backed stores live; the platform cache dir when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_dir: Option<PathBuf>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
    #[serde(default)]
    pub verify_digests: bool,
}

fn default_manifest_name() -> String {
    DEFAULT_MANIFEST_NAME.to_string()
}

fn default_root_document() -> String {
    DEFAULT_ROOT_DOCUMENT.to_string()
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_max_concurrent_fetches() -> usize {
    SyncOptions::default().max_concurrent_fetches
}

impl Config {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            manifest_name: default_manifest_name(),
            root_document: default_root_document(),
            storage_dir: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            max_concurrent_fetches: default_max_concurrent_fetches(),
            verify_digests: false,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config {}", path.display()))?;
        Ok(())
    }

    pub fn scope(&self) -> Result<Scope> {
        Scope::parse(&self.base_url).with_context(|| format!("Invalid base_url {:?}", self.base_url))
    }

    pub fn storage_root(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.storage_dir {
            return Ok(dir.clone());
        }
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            manifest_name: self.manifest_name.clone(),
            root_document: self.root_document.clone(),
            max_concurrent_fetches: self.max_concurrent_fetches.max(1),
            verify_digests: self.verify_digests,
        }
    }
}
