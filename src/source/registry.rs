//! Named templates (`base`, `@scope/name`).
//!
//! There is no network registry: a name is looked up as a directory next to
//! the referring template, in the project's package install directory, and
//! in the configured template search paths, in that order.

use chrono::Utc;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use super::{ResolvedTemplate, SourceType, TemplateMetadata};
use crate::config::RegistryConfig;
use crate::core::ResolutionError;
use crate::descriptor::locate_descriptor;
use crate::utils::fs::checksum;

static NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:@[A-Za-z0-9][A-Za-z0-9._-]*/)?[A-Za-z0-9][A-Za-z0-9._-]*(?:@[^\s/@]+)?$")
        .expect("static regex")
});

/// Whether the reference is a bare (optionally scoped, optionally versioned) name.
#[must_use]
pub fn is_registry_name(reference: &str) -> bool {
    NAME.is_match(reference.trim())
}

/// Split `name@version`, keeping the scope marker.
fn split_version(reference: &str) -> (&str, Option<&str>) {
    let r = reference.trim();
    match r.rfind('@') {
        Some(index) if index > 0 => (&r[..index], Some(&r[index + 1..])),
        _ => (r, None),
    }
}

/// Looks named templates up on the local filesystem.
#[derive(Debug, Clone, Default)]
pub struct RegistryResolver {
    install_dir: PathBuf,
    template_paths: Vec<PathBuf>,
}

impl RegistryResolver {
    /// `template_paths` should already have `~` expanded.
    #[must_use]
    pub fn new(config: &RegistryConfig, template_paths: Vec<PathBuf>) -> Self {
        Self {
            install_dir: config.install_dir.clone(),
            template_paths,
        }
    }

    /// Directories searched for `name`, in order.
    #[must_use]
    pub fn candidates(&self, name: &str, base_path: &Path) -> Vec<PathBuf> {
        let mut candidates = vec![base_path.join(name), base_path.join(&self.install_dir).join(name)];
        candidates.extend(self.template_paths.iter().map(|p| p.join(name)));
        candidates
    }

    /// The name qualified by the base path it is looked up from.
    #[must_use]
    pub fn normalize(&self, reference: &str, base_path: &Path) -> String {
        format!("registry:{}@{}", reference.trim(), base_path.display())
    }

    /// Find and read the named template.
    ///
    /// # Errors
    ///
    /// Returns [`ResolutionError::NotFound`] listing every searched location,
    /// or [`ResolutionError::FetchFailed`] when the descriptor cannot be read.
    pub async fn resolve(
        &self,
        reference: &str,
        base_path: &Path,
    ) -> Result<ResolvedTemplate, ResolutionError> {
        let (name, version) = split_version(reference);
        let candidates = self.candidates(name, base_path);

        let Some(descriptor) = candidates.iter().find_map(|dir| locate_descriptor(dir)) else {
            let location =
                candidates.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", ");
            return Err(ResolutionError::NotFound {
                reference: reference.to_string(),
                resolver: SourceType::Registry,
                location,
            });
        };

        tracing::debug!("Registry name '{}' found at {}", name, descriptor.display());
        let content = tokio::fs::read_to_string(&descriptor).await.map_err(|e| {
            ResolutionError::FetchFailed {
                reference: reference.to_string(),
                resolver: SourceType::Registry,
                cause: format!("{}: {e}", descriptor.display()),
            }
        })?;

        let base = descriptor.parent().map_or_else(|| base_path.to_path_buf(), Path::to_path_buf);
        let metadata = TemplateMetadata {
            reference: reference.to_string(),
            source_type: SourceType::Registry,
            version: version.map(str::to_string),
            fetch_timestamp: Utc::now(),
            checksum: checksum(content.as_bytes()),
            source_path: Some(descriptor),
        };

        Ok(ResolvedTemplate::new(content, base, metadata))
    }
}
