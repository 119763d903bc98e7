//! Shared helpers for the integration suite.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tempfile::TempDir;
use tplkit::cache::ResolutionCache;
use tplkit::config::{Config, SecurityConfig};
use tplkit::source::SourceManager;

/// A temporary project with its own cache directory.
pub struct TestProject {
    _temp_dir: TempDir, // Keep alive for RAII cleanup
    project_dir: PathBuf,
    cache_dir: PathBuf,
}

impl TestProject {
    pub fn new() -> Result<Self> {
        let temp_dir = TempDir::new()?;
        let project_dir = temp_dir.path().join("project");
        let cache_dir = temp_dir.path().join(".tplkit").join("cache");
        std::fs::create_dir_all(&project_dir)?;

        Ok(Self {
            _temp_dir: temp_dir,
            project_dir,
            cache_dir,
        })
    }

    pub fn project_path(&self) -> &Path {
        &self.project_dir
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_dir
    }

    /// Write `<project>/<dir>/template.yaml`.
    pub fn write_template(&self, dir: &str, yaml: &str) -> PathBuf {
        tplkit::test_utils::write_template(&self.project_dir, dir, yaml)
    }

    /// Write a file relative to the project directory.
    pub fn write_file(&self, path: &str, content: &str) -> Result<PathBuf> {
        let file = self.project_dir.join(path);
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&file, content)
            .with_context(|| format!("Failed to write {}", file.display()))?;
        Ok(file)
    }

    /// Configuration pointing repository references at `raw_base_url`, with
    /// plain HTTP allowed and the cache in this project.
    pub fn config(&self, raw_base_url: &str) -> Config {
        let mut config = tplkit::test_utils::config_with_cache(&self.cache_dir);
        config.security = relaxed_policy();
        config.repository.raw_base_url = raw_base_url.to_string();
        config
    }

    pub fn manager(&self, config: &Config) -> SourceManager {
        let cache = ResolutionCache::with_dir(
            self.cache_dir.clone(),
            Duration::from_secs(config.cache.ttl_secs),
            config.cache.max_size,
        );
        SourceManager::from_config(config).unwrap().with_cache(cache)
    }

    /// Run the tplkit binary in the project directory.
    pub fn run_tplkit(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = Command::new(env!("CARGO_BIN_EXE_tplkit"))
            .args(args)
            .current_dir(&self.project_dir)
            .env("TPLKIT_CACHE_DIR", &self.cache_dir)
            .env("TPLKIT_CONFIG_PATH", self.project_dir.join("missing-config.toml"))
            .env("NO_COLOR", "1")
            .output()
            .context("Failed to run tplkit")?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
            code: output.status.code(),
        })
    }
}

pub fn relaxed_policy() -> SecurityConfig {
    SecurityConfig {
        require_https: false,
        request_timeout_secs: 5,
        ..SecurityConfig::default()
    }
}

/// Captured process output.
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub code: Option<i32>,
}

impl CommandOutput {
    pub fn assert_success(&self) -> &Self {
        assert!(self.success, "Command failed with code {:?}\nStderr: {}", self.code, self.stderr);
        self
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.stdout)
            .unwrap_or_else(|e| panic!("stdout is not JSON ({e}):\n{}", self.stdout))
    }
}
