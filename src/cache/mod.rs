//! On-disk resolution cache.
//!
//! Resolved templates are cached per normalized reference so that resolving
//! the same unchanged reference twice within the TTL performs one fetch.
//!
//! # Layout
//!
//! ```text
//! <cache_dir>/
//! ├── <sha256(normalized reference)>/
//! │   ├── content          # raw descriptor text
//! │   └── metadata.json    # CacheEntry: provenance, checksum, timestamps
//! ├── .staging-<uuid>/     # in-progress writes, renamed into place
//! └── .locks/<key>.lock    # per-entry fs4 locks
//! ```
//!
//! # Integrity
//!
//! A `get` is a miss (never an error) when the entry is absent, older than
//! the TTL, unreadable, or its content no longer matches the stored
//! checksum. Corrupt and expired entries are evicted on the spot. Entries for
//! local sources also remember the descriptor path and are treated as stale
//! once that file changes.
//!
//! # Concurrency
//!
//! Operations on one key are serialized in-process with [`KeyedLocks`] and
//! across processes with a [`CacheLock`]. Writes
//! are staged in a uuid-named directory and renamed into place, so readers
//! never observe a half-written entry. Different keys never contend.
//!
//! Instances are independent; nothing is global, so tests and concurrent
//! resolutions can each own a cache.

pub mod lock;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{CacheConfig, get_cache_dir};
use crate::constants::CACHE_EVICTION_TARGET_RATIO;
use crate::source::fetch::{cleanup_materialized, materialize, materialized_root};
use crate::source::{ResolvedTemplate, TemplateMetadata};
use crate::utils::fs::{checksum, dir_size_async, hash_key};

pub use lock::{CacheLock, KeyedGuard, KeyedLocks};

/// Name of the file holding an entry's raw template text.
pub const CONTENT_FILE: &str = "content";
const METADATA_FILE: &str = "metadata.json";
const STAGING_PREFIX: &str = ".staging-";

/// The metadata record stored next to each entry's content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// The normalized reference the key was derived from
    pub key_reference: String,
    pub cached_at: DateTime<Utc>,
    /// Base path of the resolved template when it was stored
    pub base_path: PathBuf,
    pub metadata: TemplateMetadata,
}

/// Summary returned by [`ResolutionCache::get_info`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheInfo {
    pub dir: PathBuf,
    pub entries: usize,
    pub total_size: u64,
    pub max_size: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// Outcome of [`ResolutionCache::validate`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub checked: usize,
    pub removed: usize,
}

/// One entry directory as found on disk.
struct EntryDir {
    dir: PathBuf,
    entry: Option<CacheEntry>,
    size: u64,
}

/// Content-addressed, TTL-bounded, size-bounded template cache.
#[derive(Debug, Clone)]
pub struct ResolutionCache {
    dir: PathBuf,
    ttl: Duration,
    max_size: u64,
    key_locks: KeyedLocks,
}

impl ResolutionCache {
    /// Create a cache from configuration, honoring `TPLKIT_CACHE_DIR`.
    ///
    /// # Errors
    ///
    /// Returns an error if no cache directory can be determined.
    pub fn new(config: &CacheConfig) -> Result<Self> {
        let dir = get_cache_dir(config.dir.as_deref())?;
        Ok(Self::with_dir(dir, config.ttl(), config.max_size))
    }

    /// Create a cache rooted at `dir`. The directory is created lazily.
    #[must_use]
    pub fn with_dir(dir: PathBuf, ttl: Duration, max_size: u64) -> Self {
        Self {
            dir,
            ttl,
            max_size,
            key_locks: KeyedLocks::new(),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Hash of the normalized reference; also the entry directory name.
    #[must_use]
    pub fn key(reference: &str) -> String {
        hash_key(reference)
    }

    fn entry_dir(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    /// Keys currently locked by in-flight operations on this instance.
    #[must_use]
    pub fn locked_keys(&self) -> usize {
        self.key_locks.len()
    }

    /// Look up a normalized reference.
    ///
    /// Returns `None` on any kind of miss; corrupt or expired entries are
    /// removed before returning.
    pub async fn get(&self, reference: &str) -> Option<ResolvedTemplate> {
        let key = Self::key(reference);
        let _guard = self.key_locks.lock(&key).await;

        let dir = self.entry_dir(&key);
        if !dir.is_dir() {
            tracing::debug!("Cache miss for {}", reference);
            return None;
        }

        match self.load_entry(&dir).await {
            Ok(Some(resolved)) => {
                tracing::debug!("Cache hit for {}", reference);
                Some(resolved)
            }
            Ok(None) => {
                self.remove_entry_dir(&dir).await;
                None
            }
            Err(e) => {
                tracing::warn!("Discarding corrupt cache entry for {}: {:#}", reference, e);
                self.remove_entry_dir(&dir).await;
                None
            }
        }
    }

    /// Read and verify one entry. `Ok(None)` means expired or stale.
    async fn load_entry(&self, dir: &Path) -> Result<Option<ResolvedTemplate>> {
        let entry = read_entry(dir).await?;

        let age = Utc::now().signed_duration_since(entry.cached_at);
        if age.to_std().is_ok_and(|age| age > self.ttl) {
            tracing::debug!("Cache entry for {} expired", entry.key_reference);
            return Ok(None);
        }

        let content_path = dir.join(CONTENT_FILE);
        let content = tokio::fs::read_to_string(&content_path)
            .await
            .with_context(|| format!("Failed to read {}", content_path.display()))?;

        let actual = checksum(content.as_bytes());
        if actual != entry.metadata.checksum {
            anyhow::bail!("checksum mismatch: expected {}, found {actual}", entry.metadata.checksum);
        }

        if let Some(source) = &entry.metadata.source_path
            && source_changed(source, entry.cached_at).await
        {
            tracing::debug!("Source {} changed since it was cached", source.display());
            return Ok(None);
        }

        let base_path = if entry.base_path.is_dir() {
            entry.base_path.clone()
        } else {
            materialize(&content).await?
        };

        Ok(Some(ResolvedTemplate::new(content, base_path, entry.metadata)))
    }

    /// Store a resolved template under a normalized reference.
    ///
    /// Replaces any existing entry, then evicts oldest entries if the cache
    /// grew past its maximum size.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be written.
    pub async fn set(&self, reference: &str, resolved: &ResolvedTemplate) -> Result<()> {
        let key = Self::key(reference);
        {
            let _guard = self.key_locks.lock(&key).await;
            let _file_lock = CacheLock::acquire(&self.dir, &key).await?;

            let staging = self.dir.join(format!("{STAGING_PREFIX}{}", uuid::Uuid::new_v4()));
            if let Err(e) = self.write_staged(&staging, reference, resolved).await {
                let _ = tokio::fs::remove_dir_all(&staging).await;
                return Err(e);
            }

            let dir = self.entry_dir(&key);
            if dir.exists() {
                tokio::fs::remove_dir_all(&dir)
                    .await
                    .with_context(|| format!("Failed to replace cache entry {}", dir.display()))?;
            }
            if let Err(e) = tokio::fs::rename(&staging, &dir).await {
                let _ = tokio::fs::remove_dir_all(&staging).await;
                return Err(e).with_context(|| format!("Failed to commit cache entry {key}"));
            }
            tracing::debug!("Cached {} as {}", reference, key);
        }

        self.evict_if_needed().await
    }

    async fn write_staged(
        &self,
        staging: &Path,
        reference: &str,
        resolved: &ResolvedTemplate,
    ) -> Result<()> {
        tokio::fs::create_dir_all(staging)
            .await
            .with_context(|| format!("Failed to create directory: {}", staging.display()))?;

        let entry = CacheEntry {
            key_reference: reference.to_string(),
            cached_at: Utc::now(),
            base_path: resolved.base_path().to_path_buf(),
            metadata: resolved.metadata().clone(),
        };
        let json = serde_json::to_vec_pretty(&entry).context("Failed to serialize cache entry")?;

        tokio::fs::write(staging.join(CONTENT_FILE), resolved.content())
            .await
            .context("Failed to write cached content")?;
        tokio::fs::write(staging.join(METADATA_FILE), json)
            .await
            .context("Failed to write cache metadata")?;
        Ok(())
    }

    /// Remove the entry for a normalized reference. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry exists but cannot be removed.
    pub async fn delete(&self, reference: &str) -> Result<bool> {
        let key = Self::key(reference);
        let _guard = self.key_locks.lock(&key).await;

        let dir = self.entry_dir(&key);
        if !dir.exists() {
            return Ok(false);
        }
        tokio::fs::remove_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to remove cache entry {}", dir.display()))?;
        Ok(true)
    }

    /// Remove every entry and leftover staging directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache directory cannot be read or an entry
    /// cannot be removed.
    pub async fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        for dir in self.entry_dirs().await? {
            tokio::fs::remove_dir_all(&dir)
                .await
                .with_context(|| format!("Failed to remove cache entry {}", dir.display()))?;
            removed += 1;
        }
        self.remove_staging_dirs().await?;
        tracing::info!("Cleared {} cache entries from {}", removed, self.dir.display());
        Ok(removed)
    }

    /// Count entries and their total size.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache directory cannot be read.
    pub async fn get_info(&self) -> Result<CacheInfo> {
        let entries = self.scan().await?;
        let stamps = entries.iter().filter_map(|e| e.entry.as_ref().map(|entry| entry.cached_at));

        Ok(CacheInfo {
            dir: self.dir.clone(),
            entries: entries.len(),
            total_size: entries.iter().map(|e| e.size).sum(),
            max_size: self.max_size,
            oldest: stamps.clone().min(),
            newest: stamps.max(),
        })
    }

    /// Verify every entry, removing the unreadable and corrupt ones.
    ///
    /// Also sweeps leftover staging directories, stale lock files, and
    /// materialized templates older than the TTL. Entries whose materialized
    /// directory is gone are rebuilt on their next `get`.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache directory cannot be read.
    pub async fn validate(&self) -> Result<ValidationReport> {
        let mut report = ValidationReport::default();

        for dir in self.entry_dirs().await? {
            report.checked += 1;
            let verdict = match read_entry(&dir).await {
                Ok(entry) => match tokio::fs::read(dir.join(CONTENT_FILE)).await {
                    Ok(content) if checksum(&content) == entry.metadata.checksum => Ok(()),
                    Ok(_) => Err("checksum mismatch".to_string()),
                    Err(e) => Err(e.to_string()),
                },
                Err(e) => Err(format!("{e:#}")),
            };
            if let Err(reason) = verdict {
                tracing::warn!("Removing invalid cache entry {}: {}", dir.display(), reason);
                self.remove_entry_dir(&dir).await;
                report.removed += 1;
            }
        }

        self.remove_staging_dirs().await?;
        lock::cleanup_stale_locks(&self.dir, self.ttl).await?;
        cleanup_materialized(&materialized_root(), self.ttl).await?;
        Ok(report)
    }

    /// Evict oldest entries until usage drops to the target ratio of `max_size`.
    async fn evict_if_needed(&self) -> Result<()> {
        let mut entries = self.scan().await?;
        let mut total: u64 = entries.iter().map(|e| e.size).sum();
        if total <= self.max_size {
            return Ok(());
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let target = (self.max_size as f64 * CACHE_EVICTION_TARGET_RATIO) as u64;

        // Unreadable entries sort first so they go before any valid one.
        entries.sort_by_key(|e| e.entry.as_ref().map(|entry| entry.cached_at));

        let mut evicted = 0;
        for candidate in entries {
            if total <= target {
                break;
            }
            let key = candidate
                .dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let _guard = self.key_locks.lock(&key).await;
            self.remove_entry_dir(&candidate.dir).await;
            total = total.saturating_sub(candidate.size);
            evicted += 1;
        }

        tracing::warn!(
            "Cache exceeded {} bytes; evicted {} entries, {} bytes remain",
            self.max_size,
            evicted,
            total
        );
        Ok(())
    }

    async fn scan(&self) -> Result<Vec<EntryDir>> {
        let mut entries = Vec::new();
        for dir in self.entry_dirs().await? {
            let entry = read_entry(&dir).await.ok();
            let size = dir_size_async(dir.clone()).await?;
            entries.push(EntryDir {
                dir,
                entry,
                size,
            });
        }
        Ok(entries)
    }

    /// Entry directories, skipping dot-prefixed bookkeeping directories.
    async fn entry_dirs(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut dirs = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("Failed to read cache directory {}", self.dir.display()))?;
        while let Some(item) = read_dir.next_entry().await? {
            let hidden = item.file_name().to_string_lossy().starts_with('.');
            if !hidden && item.file_type().await?.is_dir() {
                dirs.push(item.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    async fn remove_staging_dirs(&self) -> Result<()> {
        if !self.dir.exists() {
            return Ok(());
        }
        let mut read_dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(item) = read_dir.next_entry().await? {
            if item.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
                let _ = tokio::fs::remove_dir_all(item.path()).await;
            }
        }
        Ok(())
    }

    async fn remove_entry_dir(&self, dir: &Path) {
        if let Err(e) = tokio::fs::remove_dir_all(dir).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!("Failed to remove cache entry {}: {}", dir.display(), e);
        }
    }
}

async fn read_entry(dir: &Path) -> Result<CacheEntry> {
    let path = dir.join(METADATA_FILE);
    let raw = tokio::fs::read(&path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Whether a local source file was modified after `cached_at` or is gone.
async fn source_changed(source: &Path, cached_at: DateTime<Utc>) -> bool {
    match tokio::fs::metadata(source).await.and_then(|m| m.modified()) {
        Ok(modified) => DateTime::<Utc>::from(modified) > cached_at,
        Err(_) => true,
    }
}
