//! Global configuration for the resolution core.
//!
//! The configuration file is stored in a platform-specific location:
//!
//! - **Unix/macOS**: `~/.tplkit/config.toml`
//! - **Windows**: `%LOCALAPPDATA%\tplkit\config.toml`
//!
//! The location can be overridden using the `TPLKIT_CONFIG_PATH` environment
//! variable. A missing file is not an error; every section has defaults.
//!
//! # File Format
//!
//! ```toml
//! [security]
//! require_https = true
//! allowed_domains = ["github.com", "raw.githubusercontent.com"]
//! blocked_domains = []
//! max_download_size = 10485760
//! request_timeout_secs = 30
//!
//! [cache]
//! enabled = true
//! ttl_secs = 86400
//! max_size = 104857600
//!
//! [repository]
//! host = "github.com"
//! raw_base_url = "https://raw.githubusercontent.com"
//! default_ref = "main"
//!
//! [registry]
//! install_dir = "node_modules"
//! template_paths = ["~/.tplkit/templates"]
//!
//! [composition]
//! default_strategy = "merge"
//! max_depth = 10
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

use crate::compose::ConflictStrategy;
use crate::constants::{
    DEFAULT_CACHE_MAX_SIZE, DEFAULT_CACHE_TTL, DEFAULT_MAX_COMPOSITION_DEPTH,
    DEFAULT_MAX_DOWNLOAD_SIZE, DEFAULT_RAW_CONTENT_BASE_URL, DEFAULT_REGISTRY_INSTALL_DIR,
    DEFAULT_REPOSITORY_HOST, DEFAULT_REPOSITORY_REF, DEFAULT_REQUEST_TIMEOUT,
};
use crate::utils::fs::atomic_write;

/// Top-level configuration consumed by the resolution core.
///
/// The core never owns this file; a caller (the driver binary, a CLI, a test)
/// loads it and hands the relevant sections to the components it builds.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Transport and domain policy for remote fetches
    pub security: SecurityConfig,
    /// On-disk resolution cache
    pub cache: CacheConfig,
    /// Hosted repository service used by repository references
    pub repository: RepositoryConfig,
    /// Template and package registry lookup
    pub registry: RegistryConfig,
    /// Composition defaults
    pub composition: CompositionConfig,
}

/// Security policy applied before and during every fetch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SecurityConfig {
    /// Reject plain `http://` references
    pub require_https: bool,
    /// When non-empty, only these domains (and their subdomains) may be fetched
    pub allowed_domains: Vec<String>,
    /// Domains (and their subdomains) that may never be fetched
    pub blocked_domains: Vec<String>,
    /// Maximum payload size in bytes, enforced while streaming
    pub max_download_size: u64,
    /// Hard timeout for a single fetch
    pub request_timeout_secs: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            require_https: true,
            allowed_domains: Vec::new(),
            blocked_domains: Vec::new(),
            max_download_size: DEFAULT_MAX_DOWNLOAD_SIZE,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT.as_secs(),
        }
    }
}

impl SecurityConfig {
    /// The request timeout as a [`Duration`].
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Resolution cache settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether the resolution manager consults the cache at all
    pub enabled: bool,
    /// Cache directory; see [`get_cache_dir`] for the fallback order
    pub dir: Option<PathBuf>,
    /// Entry time-to-live in seconds
    pub ttl_secs: u64,
    /// Maximum total size in bytes before oldest-first eviction
    pub max_size: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            ttl_secs: DEFAULT_CACHE_TTL.as_secs(),
            max_size: DEFAULT_CACHE_MAX_SIZE,
        }
    }
}

impl CacheConfig {
    /// The TTL as a [`Duration`].
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Hosted repository service settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Web host of the repository service (used to recognize full URLs)
    pub host: String,
    /// Base URL for raw file content
    pub raw_base_url: String,
    /// Ref used when a reference does not pin one
    pub default_ref: String,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_REPOSITORY_HOST.to_string(),
            raw_base_url: DEFAULT_RAW_CONTENT_BASE_URL.to_string(),
            default_ref: DEFAULT_REPOSITORY_REF.to_string(),
        }
    }
}

/// Registry lookup settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RegistryConfig {
    /// Directory under the project root where registry packages are installed
    pub install_dir: PathBuf,
    /// Extra directories searched for named templates (`~` is expanded)
    pub template_paths: Vec<PathBuf>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            install_dir: PathBuf::from(DEFAULT_REGISTRY_INSTALL_DIR),
            template_paths: Vec::new(),
        }
    }
}

/// Composition defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CompositionConfig {
    /// Strategy used for `extends` collisions and includes without a strategy
    pub default_strategy: ConflictStrategy,
    /// Maximum nesting of `extends`/`includes`
    pub max_depth: usize,
}

impl Default for CompositionConfig {
    fn default() -> Self {
        Self {
            default_strategy: ConflictStrategy::Merge,
            max_depth: DEFAULT_MAX_COMPOSITION_DEPTH,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Returns defaults when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn load() -> Result<Self> {
        Self::load_with_optional(None).await
    }

    /// Load configuration from `path`, or from the default location when `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn load_with_optional(path: Option<PathBuf>) -> Result<Self> {
        let path = match path {
            Some(path) => path,
            None => Self::default_path()?,
        };
        if path.exists() {
            Self::load_from(&path).await
        } else {
            tracing::debug!("No configuration at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or contains invalid TOML.
    pub async fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Write the configuration as TOML, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub async fn save_to(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        atomic_write(path, content.as_bytes())
            .await
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    /// Default configuration file path, honoring `TPLKIT_CONFIG_PATH`.
    ///
    /// # Errors
    ///
    /// Returns an error if the home / local data directory cannot be determined.
    pub fn default_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var("TPLKIT_CONFIG_PATH") {
            return Ok(PathBuf::from(path));
        }

        let config_dir = if cfg!(target_os = "windows") {
            dirs::data_local_dir()
                .ok_or_else(|| anyhow::anyhow!("Unable to determine local data directory"))?
                .join("tplkit")
        } else {
            dirs::home_dir()
                .ok_or_else(|| anyhow::anyhow!("Unable to determine home directory"))?
                .join(".tplkit")
        };

        Ok(config_dir.join("config.toml"))
    }

    /// The cache directory this configuration points at.
    ///
    /// # Errors
    ///
    /// See [`get_cache_dir`].
    pub fn cache_dir(&self) -> Result<PathBuf> {
        get_cache_dir(self.cache.dir.as_deref())
    }

    /// Registry template search paths with `~` and environment variables expanded.
    #[must_use]
    pub fn expanded_template_paths(&self) -> Vec<PathBuf> {
        self.registry
            .template_paths
            .iter()
            .map(|path| {
                let raw = path.to_string_lossy();
                shellexpand::full(&raw)
                    .map_or_else(|_| path.clone(), |expanded| PathBuf::from(expanded.as_ref()))
            })
            .collect()
    }
}

/// Resolve the cache directory.
///
/// Priority: `TPLKIT_CACHE_DIR`, then the configured directory, then the
/// platform default (`~/.tplkit/cache`, `%LOCALAPPDATA%\tplkit\cache`).
/// The directory is not created here; the cache creates it lazily.
///
/// # Errors
///
/// Returns an error if no explicit directory is given and the home / local
/// data directory cannot be determined.
pub fn get_cache_dir(configured: Option<&Path>) -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("TPLKIT_CACHE_DIR") {
        return Ok(PathBuf::from(dir));
    }

    if let Some(dir) = configured {
        return Ok(dir.to_path_buf());
    }

    let cache_dir = if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .ok_or_else(|| anyhow::anyhow!("Unable to determine local data directory"))?
            .join("tplkit")
            .join("cache")
    } else {
        dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("Unable to determine home directory"))?
            .join(".tplkit")
            .join("cache")
    };

    Ok(cache_dir)
}
