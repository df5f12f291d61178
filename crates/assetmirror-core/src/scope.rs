//! The caching scope: the base URL every mirrored asset lives under.
//!
//! Asset paths are scope-relative and always start with `./`. The scope maps
//! them to absolute URLs for fetching and maps intercepted request URLs back to
//! asset paths for cache lookups.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use thiserror::Error;
use url::Url;

use crate::store::StorageNames;

/// Path of the scope root itself
pub const SCOPE_ROOT: &str = "./";

/// Bytes escaped when turning an asset path into a URL path.
/// Backslash is included because special schemes treat it as `/`.
const ASSET_PATH: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'\\')
    .add(b'`')
    .add(b'{')
    .add(b'}');

#[derive(Error, Debug)]
pub enum ScopeError {
    #[error("Invalid scope URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Scope URL cannot be a base: {0}")]
    NotABase(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    base: Url,
}

impl Scope {
    /// Build a scope from a base URL. A missing trailing slash is added so
    /// `https://host/app` and `https://host/app/` name the same scope.
    pub fn new(mut base: Url) -> Result<Self, ScopeError> {
        if base.cannot_be_a_base() {
            return Err(ScopeError::NotABase(base.to_string()));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        base.set_query(None);
        base.set_fragment(None);
        Ok(Self { base })
    }

    pub fn parse(base: &str) -> Result<Self, ScopeError> {
        Self::new(Url::parse(base)?)
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// The scope's path component, e.g. `/app/`
    pub fn path(&self) -> &str {
        self.base.path()
    }

    /// Deterministic store names for this scope
    pub fn storage_names(&self) -> StorageNames {
        StorageNames::for_scope_path(self.path())
    }

    /// Absolute URL of a scope-relative asset path
    pub fn resolve(&self, asset_path: &str) -> Result<Url, url::ParseError> {
        let relative = asset_path.strip_prefix(SCOPE_ROOT).unwrap_or(asset_path);
        let encoded = utf8_percent_encode(relative, ASSET_PATH).to_string();
        self.base.join(&format!("{}{}", SCOPE_ROOT, encoded))
    }

    /// Asset path for a URL inside this scope, `None` when the URL is outside
    pub fn relative_path(&self, url: &Url) -> Option<String> {
        if url.origin() != self.base.origin() {
            return None;
        }
        let rest = url.path().strip_prefix(self.base.path())?;
        let decoded = percent_decode_str(rest).decode_utf8().ok()?;
        Some(format!("{}{}", SCOPE_ROOT, decoded))
    }
}
