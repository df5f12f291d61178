//! Conditional manifest retrieval.

use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::header::{self, HeaderValue};
use tracing::{debug, warn};
use url::Url;

use super::AssetManifest;
use crate::net::{AssetRequest, Transport};
use crate::scope::Scope;

#[derive(Clone)]
pub struct ManifestFetcher {
    transport: Arc<dyn Transport>,
    url: Url,
    root_document: String,
}

impl ManifestFetcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        scope: &Scope,
        manifest_name: &str,
        root_document: impl Into<String>,
    ) -> Result<Self, url::ParseError> {
        Ok(Self {
            transport,
            url: scope.resolve(manifest_name)?,
            root_document: root_document.into(),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Fetch the manifest, bypassing intermediate caches.
    ///
    /// `None` means "no update available": the server answered 304 or another
    /// non-success status, the request failed, or the payload did not parse.
    /// Failures are logged and never propagate.
    pub async fn fetch_manifest(&self, last_modified: Option<&str>) -> Option<AssetManifest> {
        match self.try_fetch(last_modified).await {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(url = %self.url, error = %e, "Manifest fetch failed, assuming no update");
                None
            }
        }
    }

    async fn try_fetch(&self, last_modified: Option<&str>) -> Result<Option<AssetManifest>> {
        let mut request = AssetRequest::get(self.url.clone())
            .with_header(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        if let Some(ts) = last_modified {
            let value = HeaderValue::from_str(ts)
                .with_context(|| format!("Invalid Last-Modified value {:?}", ts))?;
            request = request.with_header(header::IF_MODIFIED_SINCE, value);
        }

        let response = self
            .transport
            .send(request)
            .await
            .context("Failed to send manifest request")?;

        if !response.is_success() {
            debug!(url = %self.url, status = %response.status, "No manifest update");
            return Ok(None);
        }

        let last_modified = response
            .headers
            .get(header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let manifest = AssetManifest::from_bytes(&response.body, last_modified, &self.root_document)
            .context("Failed to parse manifest")?;

        debug!(
            digest = %manifest.digest,
            entries = manifest.entries.len(),
            "Manifest fetched"
        );
        Ok(Some(manifest))
    }
}
