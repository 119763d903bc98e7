//! Template sources: resolving references into template content.
//!
//! A reference is the string a descriptor uses to point at another template
//! (`extends`, an include `url`, a dependency). Each kind of reference is
//! handled by one resolver:
//!
//! | Reference | Resolver |
//! |---|---|
//! | `./base`, `../shared`, `/abs/path`, `~/templates/x`, `file:///abs` | [`LocalResolver`] |
//! | `owner/repo[@ref][/path]`, `github:owner/repo`, repository web and raw URLs | [`RepositoryResolver`] |
//! | any other `http(s)://` URL | [`HttpResolver`] |
//! | `base`, `@scope/name` | [`RegistryResolver`] |
//!
//! Resolvers form the closed set [`Resolver`]; the [`SourceManager`] picks the
//! first one whose [`Resolver::supports`] accepts a reference, wraps it with
//! the [`crate::cache::ResolutionCache`] and enforces the security policy.
//! No resolver retries; retry policy belongs to the caller.

pub mod fetch;
pub mod http;
pub mod local;
pub mod manager;
pub mod registry;
pub mod repository;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::RepositoryConfig;
use crate::core::ResolutionError;

pub use fetch::SecureFetcher;
pub use http::HttpResolver;
pub use local::LocalResolver;
pub use manager::SourceManager;
pub use registry::RegistryResolver;
pub use repository::{RepositoryReference, RepositoryResolver};

/// The kind of source a reference resolves from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Local,
    Repository,
    Http,
    Registry,
}

impl SourceType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Repository => "repository",
            Self::Http => "http",
            Self::Registry => "registry",
        }
    }

    /// Whether fetching this kind of reference goes over the network.
    #[must_use]
    pub const fn is_remote(self) -> bool {
        matches!(self, Self::Repository | Self::Http)
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provenance of a resolved template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMetadata {
    /// The reference as it was requested
    pub reference: String,
    pub source_type: SourceType,
    /// Ref, tag or package version when the source has one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub fetch_timestamp: DateTime<Utc>,
    /// `sha256:<hex>` of the content
    pub checksum: String,
    /// Descriptor file on disk for local and registry sources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<PathBuf>,
}

/// The immutable result of resolving one reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedTemplate {
    content: String,
    base_path: PathBuf,
    metadata: TemplateMetadata,
}

impl ResolvedTemplate {
    #[must_use]
    pub const fn new(content: String, base_path: PathBuf, metadata: TemplateMetadata) -> Self {
        Self {
            content,
            base_path,
            metadata,
        }
    }

    /// Raw descriptor text.
    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Directory the template's files live in; relative references inside
    /// the template resolve against it.
    #[must_use]
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    #[must_use]
    pub const fn metadata(&self) -> &TemplateMetadata {
        &self.metadata
    }

    #[must_use]
    pub fn checksum(&self) -> &str {
        &self.metadata.checksum
    }
}

/// Classify a reference by syntax alone.
///
/// Returns `None` when the reference matches no known form. The order of
/// checks mirrors the resolver order of [`SourceManager`].
#[must_use]
pub fn classify(reference: &str, repository: &RepositoryConfig) -> Option<SourceType> {
    if local::is_local_reference(reference) {
        Some(SourceType::Local)
    } else if repository::is_repository_reference(reference, repository) {
        Some(SourceType::Repository)
    } else if http::is_http_url(reference) {
        Some(SourceType::Http)
    } else if registry::is_registry_name(reference) {
        Some(SourceType::Registry)
    } else {
        None
    }
}

/// The closed set of resolvers.
#[derive(Debug, Clone)]
pub enum Resolver {
    Local(LocalResolver),
    Repository(RepositoryResolver),
    Http(HttpResolver),
    Registry(RegistryResolver),
}

impl Resolver {
    #[must_use]
    pub const fn source_type(&self) -> SourceType {
        match self {
            Self::Local(_) => SourceType::Local,
            Self::Repository(_) => SourceType::Repository,
            Self::Http(_) => SourceType::Http,
            Self::Registry(_) => SourceType::Registry,
        }
    }

    /// Whether this resolver understands the reference syntax.
    #[must_use]
    pub fn supports(&self, reference: &str) -> bool {
        match self {
            Self::Local(_) => local::is_local_reference(reference),
            Self::Repository(r) => r.supports(reference),
            Self::Http(_) => http::is_http_url(reference),
            Self::Registry(_) => registry::is_registry_name(reference),
        }
    }

    /// Canonical form of the reference, used as the cache key.
    #[must_use]
    pub fn normalize(&self, reference: &str, base_path: &Path) -> String {
        match self {
            Self::Local(r) => r.normalize(reference, base_path),
            Self::Repository(r) => r.normalize(reference),
            Self::Http(r) => r.normalize(reference),
            Self::Registry(r) => r.normalize(reference, base_path),
        }
    }

    /// Fetch the template content for `reference`.
    ///
    /// # Errors
    ///
    /// Returns a [`ResolutionError`] naming the reference and this resolver.
    pub async fn resolve(
        &self,
        reference: &str,
        base_path: &Path,
    ) -> Result<ResolvedTemplate, ResolutionError> {
        match self {
            Self::Local(r) => r.resolve(reference, base_path).await,
            Self::Repository(r) => r.resolve(reference).await,
            Self::Http(r) => r.resolve(reference).await,
            Self::Registry(r) => r.resolve(reference, base_path).await,
        }
    }
}
