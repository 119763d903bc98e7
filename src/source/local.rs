//! Local filesystem references.

use chrono::Utc;
use std::path::{Path, PathBuf};

use super::{ResolvedTemplate, SourceType, TemplateMetadata};
use crate::core::ResolutionError;
use crate::descriptor::locate_descriptor;
use crate::utils::fs::checksum;
use crate::utils::security::validate_path_security;

const FILE_SCHEME: &str = "file://";

/// Whether the reference is written as a local path.
#[must_use]
pub fn is_local_reference(reference: &str) -> bool {
    let r = reference.trim();
    if r.is_empty() {
        return false;
    }
    let bytes = r.as_bytes();
    let windows_drive = bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'\\' || bytes[2] == b'/');

    r.starts_with(FILE_SCHEME)
        || r.starts_with('/')
        || r.starts_with("./")
        || r.starts_with("../")
        || r.starts_with(".\\")
        || r.starts_with("..\\")
        || r == "."
        || r == ".."
        || r == "~"
        || r.starts_with("~/")
        || windows_drive
}

/// Resolves local paths, relative ones against the caller's base path.
#[derive(Debug, Clone, Default)]
pub struct LocalResolver;

impl LocalResolver {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Turn a reference into an absolute path without touching the filesystem.
    ///
    /// Strips `file://`, expands `~`, joins relative paths onto `base_path`
    /// and removes `.`/`..` components lexically.
    #[must_use]
    pub fn resolve_path(reference: &str, base_path: &Path) -> PathBuf {
        let raw = reference.trim();
        let raw = raw.strip_prefix(FILE_SCHEME).unwrap_or(raw);
        let expanded = shellexpand::tilde(raw);
        let path = Path::new(expanded.as_ref());

        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else if base_path.is_absolute() {
            base_path.join(path)
        } else {
            std::env::current_dir().unwrap_or_default().join(base_path).join(path)
        };
        clean_path(&joined)
    }

    /// Cache key form: an absolute `file://` URL-like string.
    ///
    /// A directory that holds a descriptor normalizes to the descriptor
    /// file, so both spellings share one cache entry.
    #[must_use]
    pub fn normalize(&self, reference: &str, base_path: &Path) -> String {
        let path = Self::resolve_path(reference, base_path);
        let path = locate_descriptor(&path).unwrap_or(path);
        format!("{FILE_SCHEME}{}", path.display())
    }

    /// Read the descriptor at `reference`.
    ///
    /// # Errors
    ///
    /// Returns [`ResolutionError::SecurityViolation`] for blocked system
    /// paths, [`ResolutionError::NotFound`] when no descriptor exists there
    /// and [`ResolutionError::FetchFailed`] when reading fails.
    pub async fn resolve(
        &self,
        reference: &str,
        base_path: &Path,
    ) -> Result<ResolvedTemplate, ResolutionError> {
        let path = Self::resolve_path(reference, base_path);
        let path = tokio::fs::canonicalize(&path).await.unwrap_or(path);

        validate_path_security(&path).map_err(|reason| ResolutionError::SecurityViolation {
            reference: reference.to_string(),
            resolver: Some(SourceType::Local),
            reason,
        })?;

        let descriptor = locate_descriptor(&path).ok_or_else(|| ResolutionError::NotFound {
            reference: reference.to_string(),
            resolver: SourceType::Local,
            location: path.display().to_string(),
        })?;

        tracing::debug!("Reading local template {}", descriptor.display());
        let content = tokio::fs::read_to_string(&descriptor).await.map_err(|e| {
            ResolutionError::FetchFailed {
                reference: reference.to_string(),
                resolver: SourceType::Local,
                cause: format!("{}: {e}", descriptor.display()),
            }
        })?;

        let base = descriptor.parent().map_or_else(|| path.clone(), Path::to_path_buf);
        let metadata = TemplateMetadata {
            reference: reference.to_string(),
            source_type: SourceType::Local,
            version: None,
            fetch_timestamp: Utc::now(),
            checksum: checksum(content.as_bytes()),
            source_path: Some(descriptor),
        };

        Ok(ResolvedTemplate::new(content, base, metadata))
    }
}

/// Lexically normalize `.` and `..` components.
fn clean_path(path: &Path) -> PathBuf {
    use std::path::Component;

    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !cleaned.pop() {
                    cleaned.push(component);
                }
            }
            other => cleaned.push(other),
        }
    }
    cleaned
}
