//! Per-entry file locks for the resolution cache.
//!
//! Locks live in `{cache_dir}/.locks/{key}.lock` and are held for as long as
//! the returned [`CacheLock`] is alive. They serialize writers of the same
//! entry across processes; in-process callers are additionally serialized by
//! [`KeyedLocks`].

use anyhow::{Context, Result};
use dashmap::DashMap;
use fs4::fs_std::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Name of the directory holding lock files inside the cache directory.
pub const LOCKS_DIR: &str = ".locks";

/// An exclusive lock on one cache entry.
#[derive(Debug)]
pub struct CacheLock {
    file: File,
    path: PathBuf,
}

impl CacheLock {
    /// Acquire the exclusive lock for `key`, waiting for other holders.
    ///
    /// The blocking `flock` call runs on the blocking pool so the runtime
    /// keeps making progress while we wait.
    ///
    /// # Errors
    ///
    /// Returns an error if the locks directory or lock file cannot be
    /// created, or the OS refuses the lock.
    pub async fn acquire(cache_dir: &Path, key: &str) -> Result<Self> {
        let locks_dir = cache_dir.join(LOCKS_DIR);
        tokio::fs::create_dir_all(&locks_dir).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                anyhow::anyhow!(
                    "Permission denied: cannot create locks directory at {}",
                    locks_dir.display()
                )
            } else {
                anyhow::anyhow!("Failed to create directory {}: {}", locks_dir.display(), e)
            }
        })?;

        let path = locks_dir.join(format!("{key}.lock"));
        let lock_path = path.clone();
        let key = key.to_string();

        let file = tokio::task::spawn_blocking(move || -> Result<File> {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&lock_path)
                .with_context(|| format!("Failed to open lock file: {}", lock_path.display()))?;
            file.lock_exclusive()
                .with_context(|| format!("Failed to acquire cache lock for entry {key}"))?;
            Ok(file)
        })
        .await
        .context("Failed to spawn blocking task for lock acquisition")??;

        Ok(Self {
            file,
            path,
        })
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        #[allow(unstable_name_collisions)]
        if let Err(e) = self.file.unlock() {
            tracing::warn!("Failed to unlock {}: {}", self.path.display(), e);
        }
    }
}

/// Remove lock files older than `max_age`.
///
/// Lock files are never deleted on release, so crashed or finished
/// processes leave them behind. Returns the number removed.
///
/// # Errors
///
/// Returns an error if the locks directory exists but cannot be read.
pub async fn cleanup_stale_locks(cache_dir: &Path, max_age: Duration) -> Result<usize> {
    let locks_dir = cache_dir.join(LOCKS_DIR);
    if !locks_dir.exists() {
        return Ok(0);
    }

    let now = SystemTime::now();
    let mut removed = 0;
    let mut entries =
        tokio::fs::read_dir(&locks_dir).await.context("Failed to read locks directory")?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("lock") {
            continue;
        }
        let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) else {
            continue;
        };
        if let Ok(age) = now.duration_since(modified)
            && age > max_age
            && tokio::fs::remove_file(&path).await.is_ok()
        {
            removed += 1;
        }
    }

    Ok(removed)
}

/// In-process mutexes keyed by string.
///
/// A key's mutex exists only while someone holds or waits for it; the last
/// [`KeyedGuard`] to drop removes it from the map.
#[derive(Debug, Clone, Default)]
pub struct KeyedLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> KeyedGuard {
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.clone().lock_owned().await;
        KeyedGuard {
            locks: Arc::clone(&self.locks),
            key: key.to_string(),
            mutex,
            guard: Some(guard),
        }
    }

    /// Number of keys currently held or waited on.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Exclusive access to one key of a [`KeyedLocks`].
#[derive(Debug)]
pub struct KeyedGuard {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    key: String,
    mutex: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Two references left means the map and this guard; nobody is waiting.
        self.locks.remove_if(&self.key, |_, mutex| {
            Arc::ptr_eq(mutex, &self.mutex) && Arc::strong_count(mutex) == 2
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::TempDir;
    use tokio::sync::Barrier;

    #[tokio::test]
    async fn test_acquire_creates_lock_file() {
        let temp = TempDir::new().unwrap();
        let lock = CacheLock::acquire(temp.path(), "abc123").await.unwrap();
        let path = temp.path().join(LOCKS_DIR).join("abc123.lock");
        assert!(path.exists());
        drop(lock);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let temp = TempDir::new().unwrap();
        let dir = Arc::new(temp.path().to_path_buf());
        let barrier = Arc::new(Barrier::new(2));

        let holder = {
            let dir = Arc::clone(&dir);
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                let _lock = CacheLock::acquire(&dir, "entry").await.unwrap();
                barrier.wait().await;
                tokio::time::sleep(Duration::from_millis(100)).await;
            })
        };

        let waiter = tokio::spawn(async move {
            barrier.wait().await;
            let start = Instant::now();
            let _lock = CacheLock::acquire(&dir, "entry").await.unwrap();
            assert!(start.elapsed() >= Duration::from_millis(50));
        });

        holder.await.unwrap();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_stale_locks() {
        let temp = TempDir::new().unwrap();
        drop(CacheLock::acquire(temp.path(), "old").await.unwrap());
        std::fs::write(temp.path().join(LOCKS_DIR).join("notes.txt"), "keep").unwrap();

        assert_eq!(cleanup_stale_locks(temp.path(), Duration::from_secs(3600)).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cleanup_stale_locks(temp.path(), Duration::ZERO).await.unwrap(), 1);
        assert!(temp.path().join(LOCKS_DIR).join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_keyed_locks_release_their_keys() {
        let locks = KeyedLocks::new();
        {
            let _a = locks.lock("a").await;
            let _b = locks.lock("b").await;
            assert_eq!(locks.len(), 2);
        }
        assert!(locks.is_empty());

        for i in 0..100 {
            drop(locks.lock(&format!("key-{i}")).await);
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_keyed_lock_survives_while_contended() {
        let locks = KeyedLocks::new();
        let held = locks.lock("shared").await;

        let waiter = tokio::spawn({
            let locks = locks.clone();
            async move {
                let _guard = locks.lock("shared").await;
                Instant::now()
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let released = Instant::now();
        drop(held);
        assert_eq!(locks.len(), 1);

        let acquired = waiter.await.unwrap();
        assert!(acquired >= released);
        assert!(locks.is_empty());
    }
}
