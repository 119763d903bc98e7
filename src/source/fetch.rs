//! Secure, bounded HTTP fetching for remote resolvers.
//!
//! Every fetch is checked against the [`SecurityConfig`] before the request
//! is sent and again for every redirect hop. The body is streamed and the
//! size limit is enforced while streaming, so an oversized payload is
//! abandoned as soon as it crosses the limit. The whole exchange runs under
//! a hard timeout.

use anyhow::{Context, Result};
use futures::StreamExt;
use reqwest::{Client, StatusCode, redirect};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use super::SourceType;
use crate::config::SecurityConfig;
use crate::constants::{MATERIALIZED_DESCRIPTOR_NAME, MATERIALIZED_DIR_NAME, USER_AGENT};
use crate::core::ResolutionError;
use crate::utils::security::validate_url_policy;

const MAX_REDIRECTS: usize = 5;

/// HTTP client wrapper enforcing the security policy.
#[derive(Debug, Clone)]
pub struct SecureFetcher {
    client: Client,
    policy: SecurityConfig,
}

impl SecureFetcher {
    /// Build a fetcher for the given policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(policy: SecurityConfig) -> Result<Self> {
        let redirect_policy = {
            let policy = policy.clone();
            redirect::Policy::custom(move |attempt| {
                if attempt.previous().len() >= MAX_REDIRECTS {
                    attempt.error("too many redirects")
                } else if let Err(reason) = validate_url_policy(attempt.url().as_str(), &policy) {
                    attempt.error(reason)
                } else {
                    attempt.follow()
                }
            })
        };

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(policy.request_timeout())
            .redirect(redirect_policy)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            policy,
        })
    }

    #[must_use]
    pub const fn policy(&self) -> &SecurityConfig {
        &self.policy
    }

    /// Fetch `url` on behalf of `reference` and return the body as text.
    ///
    /// # Errors
    ///
    /// - [`ResolutionError::SecurityViolation`] when the URL breaks the policy
    /// - [`ResolutionError::PayloadTooLarge`] when the body exceeds the limit
    /// - [`ResolutionError::Timeout`] when the hard timeout expires
    /// - [`ResolutionError::NotFound`] / [`ResolutionError::HttpStatus`] for error statuses
    /// - [`ResolutionError::FetchFailed`] for transport failures and non-UTF-8 bodies
    pub async fn fetch_text(
        &self,
        reference: &str,
        url: &str,
        resolver: SourceType,
    ) -> Result<String, ResolutionError> {
        validate_url_policy(url, &self.policy).map_err(|reason| {
            ResolutionError::SecurityViolation {
                reference: reference.to_string(),
                resolver: Some(resolver),
                reason,
            }
        })?;

        let timeout = self.policy.request_timeout();
        tracing::info!("Fetching {} ({})", url, resolver);

        let bytes = tokio::time::timeout(timeout, self.fetch_bounded(reference, url, resolver))
            .await
            .map_err(|_| ResolutionError::Timeout {
                reference: reference.to_string(),
                resolver,
                timeout_secs: timeout.as_secs(),
            })??;

        String::from_utf8(bytes).map_err(|_| ResolutionError::FetchFailed {
            reference: reference.to_string(),
            resolver,
            cause: "content is not valid UTF-8".to_string(),
        })
    }

    async fn fetch_bounded(
        &self,
        reference: &str,
        url: &str,
        resolver: SourceType,
    ) -> Result<Vec<u8>, ResolutionError> {
        let limit = self.policy.max_download_size;
        let too_large = || ResolutionError::PayloadTooLarge {
            reference: reference.to_string(),
            resolver,
            limit,
        };
        let transport = |e: reqwest::Error| {
            if e.is_timeout() {
                ResolutionError::Timeout {
                    reference: reference.to_string(),
                    resolver,
                    timeout_secs: self.policy.request_timeout_secs,
                }
            } else if e.is_redirect() {
                ResolutionError::SecurityViolation {
                    reference: reference.to_string(),
                    resolver: Some(resolver),
                    reason: format!("redirect rejected: {e}"),
                }
            } else {
                ResolutionError::FetchFailed {
                    reference: reference.to_string(),
                    resolver,
                    cause: e.to_string(),
                }
            }
        };

        let response = self.client.get(url).send().await.map_err(transport)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ResolutionError::NotFound {
                reference: reference.to_string(),
                resolver,
                location: url.to_string(),
            });
        }
        if !status.is_success() {
            return Err(ResolutionError::HttpStatus {
                reference: reference.to_string(),
                resolver,
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        if response.content_length().is_some_and(|len| len > limit) {
            tracing::warn!("Refusing {}: declared length exceeds {} bytes", url, limit);
            return Err(too_large());
        }

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(transport)?;
            if (body.len() + chunk.len()) as u64 > limit {
                tracing::warn!("Aborting {}: payload exceeds {} bytes", url, limit);
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }

        Ok(body)
    }
}

/// Directory that [`materialize`] creates its per-fetch directories in.
#[must_use]
pub fn materialized_root() -> PathBuf {
    std::env::temp_dir().join(MATERIALIZED_DIR_NAME)
}

/// Write fetched content into a fresh directory under [`materialized_root`].
///
/// Returns the directory, which holds the content as the conventional
/// descriptor file name. Old directories are swept by
/// [`cleanup_materialized`].
///
/// # Errors
///
/// Returns an error if the directory or file cannot be created.
pub async fn materialize(content: &str) -> Result<PathBuf> {
    materialize_in(&materialized_root(), content).await
}

async fn materialize_in(root: &Path, content: &str) -> Result<PathBuf> {
    let dir = root.join(uuid::Uuid::new_v4().to_string());
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    let file = dir.join(MATERIALIZED_DESCRIPTOR_NAME);
    tokio::fs::write(&file, content)
        .await
        .with_context(|| format!("Failed to write {}", file.display()))?;
    Ok(dir)
}

/// Remove materialized directories under `root` last modified more than
/// `max_age` ago. Returns how many were removed.
///
/// # Errors
///
/// Returns an error if `root` exists but cannot be read.
pub async fn cleanup_materialized(root: &Path, max_age: Duration) -> Result<usize> {
    if !root.is_dir() {
        return Ok(0);
    }

    let now = SystemTime::now();
    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(root)
        .await
        .with_context(|| format!("Failed to read {}", root.display()))?;

    while let Some(entry) = entries.next_entry().await? {
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if !metadata.is_dir() {
            continue;
        }
        if let Ok(modified) = metadata.modified()
            && now.duration_since(modified).is_ok_and(|age| age > max_age)
            && tokio::fs::remove_dir_all(entry.path()).await.is_ok()
        {
            removed += 1;
        }
    }

    if removed > 0 {
        tracing::debug!("Removed {} materialized templates from {}", removed, root.display());
    }
    Ok(removed)
}
