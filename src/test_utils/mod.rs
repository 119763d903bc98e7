//! Test utilities for tplkit
//!
//! Helpers shared by unit tests and the integration suite (enable the
//! `test-utils` feature from outside the crate):
//! - once-only tracing setup that writes through the test harness
//! - descriptor fixtures written into temporary directories
//! - a [`Config`] whose cache lives in a given directory
//!
//! # Example
//!
//! ```rust,no_run
//! use tplkit::test_utils::{init_test_logging, write_template};
//!
//! init_test_logging(None);
//! let temp = tempfile::TempDir::new().unwrap();
//! let path = write_template(temp.path(), "base", "name: base\n");
//! assert!(path.ends_with("base/template.yaml"));
//! ```

use std::path::{Path, PathBuf};
use std::sync::Once;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::config::{CacheConfig, Config};
use crate::constants::MATERIALIZED_DESCRIPTOR_NAME;

/// Global flag to ensure logging is only initialized once in tests
static INIT_LOGGING: Once = Once::new();

/// Initialize logging for tests.
///
/// Uses `level` when given, otherwise `RUST_LOG`; with neither, logging
/// stays off.
///
/// ```bash
/// RUST_LOG=tplkit=debug cargo test
/// ```
pub fn init_test_logging(level: Option<Level>) {
    INIT_LOGGING.call_once(|| {
        let filter = if let Some(level) = level {
            EnvFilter::new(level.to_string())
        } else if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            return;
        };

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .with_thread_ids(false)
            .try_init();
    });
}

/// Write `yaml` as `<root>/<dir>/template.yaml` and return the file path.
///
/// Panics on I/O failure; test-only.
pub fn write_template(root: &Path, dir: &str, yaml: &str) -> PathBuf {
    let dir = root.join(dir);
    std::fs::create_dir_all(&dir)
        .unwrap_or_else(|e| panic!("Failed to create {}: {e}", dir.display()));
    let path = dir.join(MATERIALIZED_DESCRIPTOR_NAME);
    std::fs::write(&path, yaml).unwrap_or_else(|e| panic!("Failed to write {}: {e}", path.display()));
    path
}

/// Default configuration with the cache enabled under `cache_dir`.
#[must_use]
pub fn config_with_cache(cache_dir: &Path) -> Config {
    Config {
        cache: CacheConfig {
            enabled: true,
            dir: Some(cache_dir.to_path_buf()),
            ..CacheConfig::default()
        },
        ..Config::default()
    }
}
