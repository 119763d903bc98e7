//! Global constants used throughout the tplkit codebase.
//!
//! This module contains timeout durations, size limits, and conventional
//! file names that are used across multiple modules. Defining them centrally
//! makes magic numbers more discoverable.

use std::time::Duration;

/// Conventional descriptor file names, checked in order inside a template directory.
pub const DESCRIPTOR_FILE_NAMES: &[&str] = &["template.yaml", "template.yml"];

/// File name used for the descriptor when remote content is materialized on disk.
pub const MATERIALIZED_DESCRIPTOR_NAME: &str = "template.yaml";

/// Directory under the system temp dir holding materialized remote templates.
pub const MATERIALIZED_DIR_NAME: &str = "tplkit-materialized";

/// Default timeout for a single network fetch (30 seconds).
///
/// Exceeding it fails that one reference only; sibling fetches keep running.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default maximum payload size accepted from a remote source (10 MiB).
pub const DEFAULT_MAX_DOWNLOAD_SIZE: u64 = 10 * 1024 * 1024;

/// Default time-to-live for cache entries (24 hours).
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default upper bound for the total on-disk cache size (100 MiB).
pub const DEFAULT_CACHE_MAX_SIZE: u64 = 100 * 1024 * 1024;

/// Fraction of `max_size` the cache shrinks to once eviction kicks in.
pub const CACHE_EVICTION_TARGET_RATIO: f64 = 0.8;

/// Default nesting limit for `extends`/`includes` chains.
pub const DEFAULT_MAX_COMPOSITION_DEPTH: usize = 10;

/// Default git ref used when a repository reference does not pin one.
pub const DEFAULT_REPOSITORY_REF: &str = "main";

/// Default host for repository shorthand references.
pub const DEFAULT_REPOSITORY_HOST: &str = "github.com";

/// Default base URL for raw repository content.
pub const DEFAULT_RAW_CONTENT_BASE_URL: &str = "https://raw.githubusercontent.com";

/// Default directory (relative to the project root) holding installed registry packages.
pub const DEFAULT_REGISTRY_INSTALL_DIR: &str = "node_modules";

/// User agent sent with every remote fetch.
pub const USER_AGENT: &str = concat!("tplkit/", env!("CARGO_PKG_VERSION"));
