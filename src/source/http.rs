//! Plain HTTP(S) references that are not hosted repository URLs.

use chrono::Utc;
use url::Url;

use super::fetch::{SecureFetcher, materialize};
use super::{ResolvedTemplate, SourceType, TemplateMetadata};
use crate::core::ResolutionError;
use crate::utils::fs::checksum;

/// Whether the reference is an absolute `http` or `https` URL.
#[must_use]
pub fn is_http_url(reference: &str) -> bool {
    Url::parse(reference.trim())
        .is_ok_and(|url| matches!(url.scheme(), "http" | "https") && url.host_str().is_some())
}

/// Fetches a descriptor directly from a URL.
#[derive(Debug, Clone)]
pub struct HttpResolver {
    fetcher: SecureFetcher,
}

impl HttpResolver {
    #[must_use]
    pub const fn new(fetcher: SecureFetcher) -> Self {
        Self {
            fetcher,
        }
    }

    /// The URL as serialized by the URL parser, without a fragment.
    #[must_use]
    pub fn normalize(&self, reference: &str) -> String {
        match Url::parse(reference.trim()) {
            Ok(mut url) => {
                url.set_fragment(None);
                url.to_string()
            }
            Err(_) => reference.trim().to_string(),
        }
    }

    /// Fetch the descriptor at the URL and materialize it locally.
    ///
    /// # Errors
    ///
    /// Returns any error of [`SecureFetcher::fetch_text`], or
    /// [`ResolutionError::FetchFailed`] when the content cannot be written.
    pub async fn resolve(&self, reference: &str) -> Result<ResolvedTemplate, ResolutionError> {
        let url = self.normalize(reference);
        let content = self.fetcher.fetch_text(reference, &url, SourceType::Http).await?;

        let base_path = materialize(&content).await.map_err(|e| ResolutionError::FetchFailed {
            reference: reference.to_string(),
            resolver: SourceType::Http,
            cause: format!("{e:#}"),
        })?;

        let metadata = TemplateMetadata {
            reference: reference.to_string(),
            source_type: SourceType::Http,
            version: None,
            fetch_timestamp: Utc::now(),
            checksum: checksum(content.as_bytes()),
            source_path: None,
        };

        Ok(ResolvedTemplate::new(content, base_path, metadata))
    }
}
