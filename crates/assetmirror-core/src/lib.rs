//! Core library for assetmirror - keeps a web application usable offline.
//!
//! A remote, versioned set of static assets is described by a plain-text
//! checksum manifest. This crate mirrors that set into two local stores and
//! decides, per request, whether to answer from the mirror or the network:
//!
//! - `manifest`: wire-format parser and conditional manifest fetcher
//! - `store`: index store (path → digest) and blob cache (path → response)
//! - `sync`: single-flight synchronization coordinator
//! - `intercept`: per-request serve/bypass/refresh decisions
//! - `control`: the enable/disable toggle that owns the whole lifecycle

pub mod config;
pub mod control;
pub mod intercept;
pub mod manifest;
pub mod net;
pub mod scope;
pub mod store;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use control::OfflineToggle;
pub use intercept::RequestInterceptor;
pub use manifest::{AssetEntry, AssetManifest, ManifestFetcher};
pub use net::{AssetRequest, AssetResponse, FetchError, HttpTransport, ResponseSource, Transport};
pub use scope::Scope;
pub use store::{IndexRecord, StorageNames, StoreProvider, Stores};
pub use sync::{RefreshOutcome, RefreshReport, SyncCoordinator, SyncOptions};
