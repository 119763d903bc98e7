//! Routing references to resolvers, with caching and policy enforcement.
//!
//! For every reference the manager:
//!
//! 1. classifies it by syntax and picks the first registered resolver that
//!    supports it,
//! 2. applies the security policy to URL references before anything else,
//! 3. derives the cache key from the resolver's normalized form,
//! 4. serves a verified cache hit, or resolves and stores the result.
//!
//! Concurrent requests for the same normalized reference are coalesced: the
//! second caller waits on a per-key lock and then finds the first caller's
//! cache entry. Without a cache, identical requests fetch independently.

use futures::future::join_all;
use std::path::{Path, PathBuf};

use super::{
    HttpResolver, LocalResolver, RegistryResolver, RepositoryResolver, ResolvedTemplate, Resolver,
    SecureFetcher, SourceType, classify,
};
use crate::cache::{KeyedLocks, ResolutionCache};
use crate::config::{Config, RepositoryConfig, SecurityConfig};
use crate::core::ResolutionError;
use crate::utils::fs::hash_key;
use crate::utils::security::validate_url_policy;

/// Resolves references through a closed set of resolvers and an optional cache.
#[derive(Debug, Clone)]
pub struct SourceManager {
    resolvers: Vec<Resolver>,
    cache: Option<ResolutionCache>,
    in_flight: KeyedLocks,
    policy: SecurityConfig,
    repository: RepositoryConfig,
}

impl SourceManager {
    /// A manager with the given resolvers, in priority order, and no cache.
    #[must_use]
    pub fn new(resolvers: Vec<Resolver>, policy: SecurityConfig, repository: RepositoryConfig) -> Self {
        Self {
            resolvers,
            cache: None,
            in_flight: KeyedLocks::new(),
            policy,
            repository,
        }
    }

    /// A manager with every built-in resolver, plus the cache when enabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built or the cache
    /// directory cannot be determined.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let fetcher = SecureFetcher::new(config.security.clone())?;
        let resolvers = vec![
            Resolver::Local(LocalResolver::new()),
            Resolver::Repository(RepositoryResolver::new(
                config.repository.clone(),
                fetcher.clone(),
            )),
            Resolver::Http(HttpResolver::new(fetcher)),
            Resolver::Registry(RegistryResolver::new(
                &config.registry,
                config.expanded_template_paths(),
            )),
        ];

        let manager =
            Self::new(resolvers, config.security.clone(), config.repository.clone());
        if config.cache.enabled {
            Ok(manager.with_cache(ResolutionCache::new(&config.cache)?))
        } else {
            Ok(manager)
        }
    }

    #[must_use]
    pub fn with_cache(mut self, cache: ResolutionCache) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub const fn cache(&self) -> Option<&ResolutionCache> {
        self.cache.as_ref()
    }

    #[must_use]
    pub fn resolvers(&self) -> &[Resolver] {
        &self.resolvers
    }

    /// The first registered resolver for the reference.
    ///
    /// # Errors
    ///
    /// [`ResolutionError::Unclassifiable`] when the syntax matches no known
    /// form, [`ResolutionError::NoResolver`] when it does but no registered
    /// resolver accepts it.
    pub fn route(&self, reference: &str) -> Result<&Resolver, ResolutionError> {
        if classify(reference, &self.repository).is_none() {
            return Err(ResolutionError::Unclassifiable {
                reference: reference.to_string(),
            });
        }
        self.resolvers.iter().find(|r| r.supports(reference)).ok_or_else(|| {
            ResolutionError::NoResolver {
                reference: reference.to_string(),
            }
        })
    }

    /// The normalized form of a reference, as used for cache keys.
    ///
    /// # Errors
    ///
    /// Returns the routing error when no resolver accepts the reference.
    pub fn normalize(&self, reference: &str, base_path: &Path) -> Result<String, ResolutionError> {
        Ok(self.route(reference)?.normalize(reference, base_path))
    }

    fn enforce_policy(&self, reference: &str, resolver: SourceType) -> Result<(), ResolutionError> {
        let trimmed = reference.trim();
        if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
            return Ok(());
        }
        validate_url_policy(trimmed, &self.policy).map(|_| ()).map_err(|reason| {
            ResolutionError::SecurityViolation {
                reference: reference.to_string(),
                resolver: Some(resolver),
                reason,
            }
        })
    }

    /// Resolve a single reference.
    ///
    /// Relative references resolve against `base_path`, or the current
    /// directory when it is `None`.
    ///
    /// # Errors
    ///
    /// Returns the [`ResolutionError`] of routing, policy or the resolver.
    /// Cache failures are logged and never returned.
    pub async fn resolve_one(
        &self,
        reference: &str,
        base_path: Option<&Path>,
    ) -> Result<ResolvedTemplate, ResolutionError> {
        let base_path = match base_path {
            Some(path) => path.to_path_buf(),
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        };

        let resolver = self.route(reference)?;
        let source_type = resolver.source_type();
        self.enforce_policy(reference, source_type)?;

        let normalized = resolver.normalize(reference, &base_path);
        tracing::debug!("Routing '{}' to {} resolver as {}", reference, source_type, normalized);

        let Some(cache) = &self.cache else {
            return resolver.resolve(reference, &base_path).await;
        };

        let _guard = self.in_flight.lock(&hash_key(&normalized)).await;

        if let Some(hit) = cache.get(&normalized).await {
            return Ok(hit);
        }

        let resolved = resolver.resolve(reference, &base_path).await?;
        if let Err(e) = cache.set(&normalized, &resolved).await {
            tracing::warn!("Failed to cache '{}': {:#}", reference, e);
        }
        Ok(resolved)
    }

    /// References currently being resolved through the cache.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Resolve references concurrently.
    ///
    /// Results line up with the input; one failure does not cancel the rest.
    pub async fn resolve_many<S: AsRef<str>>(
        &self,
        references: &[S],
        base_path: Option<&Path>,
    ) -> Vec<Result<ResolvedTemplate, ResolutionError>> {
        join_all(references.iter().map(|reference| self.resolve_one(reference.as_ref(), base_path)))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn relaxed_policy() -> SecurityConfig {
        SecurityConfig {
            require_https: false,
            request_timeout_secs: 5,
            ..SecurityConfig::default()
        }
    }

    fn manager_for(server: &MockServer, cache_dir: &Path, policy: SecurityConfig) -> SourceManager {
        let mut config = Config::default();
        config.security = policy;
        config.repository.raw_base_url = server.uri();
        config.cache.dir = Some(cache_dir.to_path_buf());
        config.cache.enabled = false;

        let cache = ResolutionCache::with_dir(cache_dir.to_path_buf(), Duration::from_secs(3600), 1 << 20);
        SourceManager::from_config(&config).unwrap().with_cache(cache)
    }

    #[tokio::test]
    async fn test_second_resolution_is_a_cache_hit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/acme/tpl/main/template.yaml"))
            .respond_with(ResponseTemplate::new(200).set_body_string("name: tpl\n"))
            .expect(1)
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let manager = manager_for(&server, temp.path(), relaxed_policy());

        let first = manager.resolve_one("acme/tpl", None).await.unwrap();
        let second = manager.resolve_one("acme/tpl", None).await.unwrap();
        assert_eq!(first.checksum(), second.checksum());
        assert_eq!(second.metadata().source_type, SourceType::Repository);
    }

    #[tokio::test]
    async fn test_concurrent_identical_references_fetch_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/acme/tpl/v1/template.yaml"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("name: tpl\n")
                    .set_delay(Duration::from_millis(100)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let manager = manager_for(&server, temp.path(), relaxed_policy());
        let results = manager.resolve_many(&["acme/tpl@v1", "acme/tpl@v1"], None).await;
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(manager.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_resolve_many_preserves_order_and_isolates_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/acme/slow/main/template.yaml"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("name: slow\n")
                    .set_delay(Duration::from_millis(150)),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/acme/fast/main/template.yaml"))
            .respond_with(ResponseTemplate::new(200).set_body_string("name: fast\n"))
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let manager = manager_for(&server, temp.path(), relaxed_policy());
        let results = manager
            .resolve_many(&["acme/slow", "acme/missing", "acme/fast"], None)
            .await;

        assert_eq!(results[0].as_ref().unwrap().content(), "name: slow\n");
        assert!(matches!(results[1], Err(ResolutionError::NotFound { .. })));
        assert_eq!(results[2].as_ref().unwrap().content(), "name: fast\n");

        // Failed resolutions release their keys too
        assert_eq!(manager.in_flight(), 0);
        assert_eq!(manager.cache().unwrap().locked_keys(), 0);
    }

    #[tokio::test]
    async fn test_oversized_payload_is_not_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/acme/huge/main/template.yaml"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(8192)))
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let policy = SecurityConfig {
            max_download_size: 1024,
            ..relaxed_policy()
        };
        let manager = manager_for(&server, temp.path(), policy);

        let error = manager.resolve_one("acme/huge", None).await.unwrap_err();
        assert!(error.is_security_violation());
        assert!(error.to_string().contains("1024"));
        assert_eq!(manager.cache().unwrap().get_info().await.unwrap().entries, 0);
    }

    #[tokio::test]
    async fn test_policy_blocks_before_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("name: x\n"))
            .expect(0)
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let policy = SecurityConfig {
            blocked_domains: vec!["127.0.0.1".to_string()],
            ..relaxed_policy()
        };
        let manager = manager_for(&server, temp.path(), policy);
        let reference = format!("{}/t.yaml", server.uri());
        let error = manager.resolve_one(&reference, None).await.unwrap_err();
        assert!(matches!(error, ResolutionError::SecurityViolation { .. }));
    }

    #[tokio::test]
    async fn test_local_reference_against_base_path() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("templates").join("base");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("template.yaml"), "name: base\n").unwrap();

        let manager = SourceManager::new(
            vec![Resolver::Local(LocalResolver::new())],
            SecurityConfig::default(),
            RepositoryConfig::default(),
        );
        let resolved =
            manager.resolve_one("./templates/base", Some(temp.path())).await.unwrap();
        assert_eq!(resolved.content(), "name: base\n");
    }

    #[tokio::test]
    async fn test_routing_errors() {
        let manager = SourceManager::new(
            vec![Resolver::Local(LocalResolver::new())],
            SecurityConfig::default(),
            RepositoryConfig::default(),
        );

        let error = manager.resolve_one("not a reference!", None).await.unwrap_err();
        assert!(matches!(error, ResolutionError::Unclassifiable { .. }));

        let error = manager.resolve_one("acme/templates", None).await.unwrap_err();
        assert!(matches!(error, ResolutionError::NoResolver { .. }));
    }
}
