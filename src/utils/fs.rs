//! File system helpers: checksums, directory sizes and atomic writes.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Compute the SHA-256 checksum of `content` in the `sha256:<hex>` format.
///
/// ```
/// use tplkit::utils::fs::checksum;
///
/// assert_eq!(
///     checksum(b"abc"),
///     "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
/// );
/// ```
#[must_use]
pub fn checksum(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Hex-encoded SHA-256 of a string, without the algorithm prefix.
///
/// Used to derive cache keys and directory names from references.
#[must_use]
pub fn hash_key(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Total size in bytes of all regular files below `path`.
///
/// Returns 0 for a path that does not exist. Symlinks are not followed.
pub fn dir_size(path: &Path) -> u64 {
    if !path.exists() {
        return 0;
    }
    WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.len())
        .sum()
}

/// Async wrapper around [`dir_size`] that keeps the walk off the runtime threads.
///
/// # Errors
///
/// Returns an error if the blocking task panics.
pub async fn dir_size_async(path: PathBuf) -> Result<u64> {
    tokio::task::spawn_blocking(move || dir_size(&path))
        .await
        .context("Failed to spawn blocking task for directory size calculation")
}

/// Write `content` to `path` via a sibling temporary file and a rename.
///
/// # Errors
///
/// Returns an error if the parent directory cannot be created or the
/// write/rename fails.
pub async fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let temp_path = path.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));

    tokio::fs::write(&temp_path, content)
        .await
        .with_context(|| format!("Failed to write temporary file: {}", temp_path.display()))?;

    if let Err(e) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e).with_context(|| format!("Failed to move file into place: {}", path.display()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_checksum_format() {
        let sum = checksum(b"hello");
        assert!(sum.starts_with("sha256:"));
        assert_eq!(sum.len(), 71);
        assert_eq!(sum, checksum(b"hello"));
        assert_ne!(sum, checksum(b"hello!"));
    }

    #[test]
    fn test_hash_key_has_no_prefix() {
        let key = hash_key("owner/repo");
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_dir_size() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(temp.path().join("one.txt"), "12345").unwrap();
        std::fs::write(nested.join("two.txt"), "1234567890").unwrap();

        assert_eq!(dir_size(temp.path()), 15);
        assert_eq!(dir_size(&temp.path().join("missing")), 0);
    }

    #[tokio::test]
    async fn test_atomic_write_creates_parents_and_overwrites() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("deep").join("file.txt");

        atomic_write(&target, b"first").await.unwrap();
        atomic_write(&target, b"second").await.unwrap();

        assert_eq!(std::fs::read_to_string(&target).unwrap(), "second");
        let leftovers: Vec<_> = std::fs::read_dir(target.parent().unwrap())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
