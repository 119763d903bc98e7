//! Dependency graph resolution for composed templates.
//!
//! A template's `dependencies` are normalized, filtered by
//! [`ResolveOptions`], checked for conflicting declarations and then
//! resolved concurrently, one independent task per distinct entry:
//!
//! | Type | Resolution |
//! |---|---|
//! | `registry-package` | `<project_root>/<install_dir>/<name>` must exist; an installed `package.json` version must satisfy the requested range |
//! | `local` | the path (explicit `url`, else the name) must exist, relative to the project root |
//! | `repository`, `http` | fetched through the [`SourceManager`] |
//!
//! Failures never propagate: they land in [`DependencyGraph::missing`] and
//! the caller decides what to do, typically via
//! [`DependencyGraph::all_required_failed`].

use futures::future::join_all;
use semver::{Version, VersionReq};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path, PathBuf};

use crate::constants::DEFAULT_REGISTRY_INSTALL_DIR;
use crate::descriptor::{Dependency, DependencySpec, DependencyType};
use crate::source::{LocalResolver, SourceManager};
use crate::utils::security::validate_path_security;

/// Which dependencies to resolve, and where.
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    pub project_root: PathBuf,
    /// Leave out `dev` dependencies
    pub skip_dev: bool,
    /// Resolve `optional` dependencies too. Off by default, like the CLI's
    /// `--include-optional` flag.
    pub include_optional: bool,
    /// Registry package directory, relative to the project root
    pub install_dir: PathBuf,
}

impl ResolveOptions {
    #[must_use]
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            skip_dev: false,
            include_optional: false,
            install_dir: PathBuf::from(DEFAULT_REGISTRY_INSTALL_DIR),
        }
    }
}

/// A dependency that was found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedDependency {
    pub dependency: Dependency,
    /// Where the dependency lives on disk
    pub path: PathBuf,
    /// Installed or fetched version, else the requested one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// A dependency that could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingDependency {
    pub name: String,
    #[serde(rename = "type")]
    pub dep_type: DependencyType,
    pub reason: String,
    pub optional: bool,
}

/// Entries declaring the same name with a different version or type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyConflict {
    pub name: String,
    pub entries: Vec<Dependency>,
}

/// The outcome of resolving one template's dependencies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyGraph {
    pub resolved: Vec<ResolvedDependency>,
    pub missing: Vec<MissingDependency>,
    pub conflicts: Vec<DependencyConflict>,
}

impl DependencyGraph {
    /// True when there were required dependencies and none of them resolved.
    #[must_use]
    pub fn all_required_failed(&self) -> bool {
        let missing_required = self.missing.iter().filter(|m| !m.optional).count();
        let resolved_required = self.resolved.iter().filter(|r| !r.dependency.optional).count();
        missing_required > 0 && resolved_required == 0
    }

    /// No required dependency is missing and nothing conflicts.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.conflicts.is_empty() && self.missing.iter().all(|m| m.optional)
    }
}

/// Normalize string and object forms into full [`Dependency`] values.
///
/// A bare string is a registry package; `name@version` pins a version.
#[must_use]
pub fn normalize_dependencies(specs: &[DependencySpec]) -> Vec<Dependency> {
    specs.iter().map(DependencySpec::normalize).collect()
}

/// Same-name entries that differ in version or type, in first-seen order.
fn detect_conflicts(dependencies: &[Dependency]) -> Vec<DependencyConflict> {
    let mut by_name: BTreeMap<&str, Vec<&Dependency>> = BTreeMap::new();
    let mut order = Vec::new();
    for dependency in dependencies {
        let entries = by_name.entry(&dependency.name).or_default();
        if entries.is_empty() {
            order.push(dependency.name.as_str());
        }
        entries.push(dependency);
    }

    order
        .into_iter()
        .filter_map(|name| {
            let entries = &by_name[name];
            let first = entries[0];
            let differs = entries
                .iter()
                .any(|d| d.version != first.version || d.dep_type != first.dep_type);
            differs.then(|| DependencyConflict {
                name: name.to_string(),
                entries: entries.iter().map(|d| (*d).clone()).collect(),
            })
        })
        .collect()
}

/// Resolves dependency lists against the project and the source manager.
#[derive(Debug, Clone)]
pub struct DependencyResolver {
    manager: SourceManager,
}

impl DependencyResolver {
    #[must_use]
    pub const fn new(manager: SourceManager) -> Self {
        Self {
            manager,
        }
    }

    /// Resolve every selected dependency concurrently.
    pub async fn resolve(&self, specs: &[DependencySpec], options: &ResolveOptions) -> DependencyGraph {
        let dependencies = normalize_dependencies(specs);
        let conflicts = detect_conflicts(&dependencies);
        for conflict in &conflicts {
            tracing::warn!(
                "Dependency '{}' is declared {} times with different versions or types",
                conflict.name,
                conflict.entries.len()
            );
        }

        let mut seen = HashSet::new();
        let selected: Vec<Dependency> = dependencies
            .into_iter()
            .filter(|d| !(options.skip_dev && d.dev))
            .filter(|d| options.include_optional || !d.optional)
            .filter(|d| seen.insert(d.clone()))
            .collect();

        let outcomes =
            join_all(selected.into_iter().map(|dependency| self.resolve_entry(dependency, options)))
                .await;

        let mut graph = DependencyGraph {
            conflicts,
            ..DependencyGraph::default()
        };
        for outcome in outcomes {
            match outcome {
                Ok(resolved) => graph.resolved.push(resolved),
                Err(missing) => graph.missing.push(missing),
            }
        }
        tracing::debug!(
            "Resolved {} dependencies, {} missing, {} conflicts",
            graph.resolved.len(),
            graph.missing.len(),
            graph.conflicts.len()
        );
        graph
    }

    async fn resolve_entry(
        &self,
        dependency: Dependency,
        options: &ResolveOptions,
    ) -> Result<ResolvedDependency, MissingDependency> {
        let outcome = match dependency.dep_type {
            DependencyType::RegistryPackage => resolve_package(&dependency, options).await,
            DependencyType::Local => resolve_local(&dependency, options).await,
            DependencyType::Repository | DependencyType::Http => self
                .manager
                .resolve_one(dependency.reference(), Some(&options.project_root))
                .await
                .map(|resolved| {
                    let version =
                        resolved.metadata().version.clone().or_else(|| dependency.version.clone());
                    (resolved.base_path().to_path_buf(), version)
                })
                .map_err(|e| e.to_string()),
        };

        match outcome {
            Ok((path, version)) => Ok(ResolvedDependency {
                dependency,
                path,
                version,
            }),
            Err(reason) => {
                tracing::debug!("Dependency '{}' unresolved: {}", dependency.name, reason);
                Err(MissingDependency {
                    name: dependency.name,
                    dep_type: dependency.dep_type,
                    reason,
                    optional: dependency.optional,
                })
            }
        }
    }
}

/// Check a local dependency path, returning it with the declared version.
async fn resolve_local(
    dependency: &Dependency,
    options: &ResolveOptions,
) -> Result<(PathBuf, Option<String>), String> {
    let path = LocalResolver::resolve_path(dependency.reference(), &options.project_root);
    let path = tokio::fs::canonicalize(&path).await.unwrap_or(path);
    validate_path_security(&path)?;
    if tokio::fs::try_exists(&path).await.unwrap_or(false) {
        Ok((path, dependency.version.clone()))
    } else {
        Err(format!("path {} does not exist", path.display()))
    }
}

/// Package names are one or more plain path segments (`lodash`, `@scope/pkg`).
fn is_valid_package_name(name: &str) -> bool {
    let path = Path::new(name);
    !name.is_empty()
        && !name.contains('\\')
        && path.components().all(|c| matches!(c, Component::Normal(_)))
}

/// Check an installed registry package, returning its path and version.
async fn resolve_package(
    dependency: &Dependency,
    options: &ResolveOptions,
) -> Result<(PathBuf, Option<String>), String> {
    if !is_valid_package_name(&dependency.name) {
        return Err(format!("invalid package name '{}'", dependency.name));
    }
    let path = options.project_root.join(&options.install_dir).join(&dependency.name);
    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Err(format!("not installed at {}", path.display()));
    }

    let installed = installed_version(&path).await;
    if let (Some(requested), Some(installed)) = (&dependency.version, &installed)
        && let Ok(req) = VersionReq::parse(requested)
        && let Ok(version) = Version::parse(installed)
        && !req.matches(&version)
    {
        return Err(format!("installed version {installed} does not satisfy {requested}"));
    }

    Ok((path, installed.or_else(|| dependency.version.clone())))
}

async fn installed_version(package_dir: &std::path::Path) -> Option<String> {
    let manifest = tokio::fs::read_to_string(package_dir.join("package.json")).await.ok()?;
    let value: serde_json::Value = serde_json::from_str(&manifest).ok()?;
    value.get("version")?.as_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RepositoryConfig, SecurityConfig};
    use crate::descriptor::DependencyEntry;
    use crate::source::{Resolver, SourceManager};
    use tempfile::TempDir;

    fn resolver() -> DependencyResolver {
        DependencyResolver::new(SourceManager::new(
            vec![Resolver::Local(LocalResolver::new())],
            SecurityConfig::default(),
            RepositoryConfig::default(),
        ))
    }

    fn entry(name: &str, dep_type: DependencyType) -> DependencyEntry {
        DependencyEntry {
            name: name.to_string(),
            version: None,
            dep_type: Some(dep_type),
            url: None,
            optional: false,
            dev: false,
        }
    }

    fn install(root: &std::path::Path, name: &str, version: &str) {
        let dir = root.join("node_modules").join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("package.json"), format!(r#"{{"name":"{name}","version":"{version}"}}"#))
            .unwrap();
    }

    #[test]
    fn test_normalize_mixed_forms() {
        let specs = vec![
            DependencySpec::Simple("lodash".to_string()),
            DependencySpec::Detailed(DependencyEntry {
                url: Some("./vendor/left-pad".to_string()),
                ..entry("left-pad", DependencyType::Local)
            }),
        ];
        let normalized = normalize_dependencies(&specs);
        assert_eq!(normalized.len(), 2);
        assert_eq!(normalized[0].name, "lodash");
        assert_eq!(normalized[0].dep_type, DependencyType::RegistryPackage);
        assert_eq!(normalized[1].dep_type, DependencyType::Local);
        assert_eq!(normalized[1].reference(), "./vendor/left-pad");
    }

    #[test]
    fn test_detect_conflicts() {
        let dependencies = normalize_dependencies(&[
            DependencySpec::Simple("react@18".to_string()),
            DependencySpec::Simple("lodash".to_string()),
            DependencySpec::Simple("react@17".to_string()),
            DependencySpec::Simple("lodash".to_string()),
        ]);
        let conflicts = detect_conflicts(&dependencies);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].name, "react");
        assert_eq!(conflicts[0].entries.len(), 2);
    }

    #[tokio::test]
    async fn test_registry_package_version_check() {
        let temp = TempDir::new().unwrap();
        install(temp.path(), "react", "18.2.0");
        install(temp.path(), "@acme/ui", "1.4.0");

        let specs = vec![
            DependencySpec::Simple("react@^18.0.0".to_string()),
            DependencySpec::Simple("@acme/ui@^2".to_string()),
            DependencySpec::Simple("missing-pkg".to_string()),
        ];
        let graph = resolver().resolve(&specs, &ResolveOptions::new(temp.path())).await;

        assert_eq!(graph.resolved.len(), 1);
        assert_eq!(graph.resolved[0].version.as_deref(), Some("18.2.0"));
        assert_eq!(graph.missing.len(), 2);
        assert!(graph.missing.iter().any(|m| m.reason.contains("does not satisfy")));
        assert!(graph.missing.iter().any(|m| m.reason.contains("not installed")));
        assert!(!graph.all_required_failed());
        assert!(!graph.is_complete());
    }

    #[tokio::test]
    async fn test_local_dependency_and_filters() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("vendor").join("left-pad")).unwrap();

        let specs = vec![
            DependencySpec::Detailed(DependencyEntry {
                url: Some("./vendor/left-pad".to_string()),
                ..entry("left-pad", DependencyType::Local)
            }),
            DependencySpec::Detailed(DependencyEntry {
                dev: true,
                ..entry("eslint", DependencyType::RegistryPackage)
            }),
            DependencySpec::Detailed(DependencyEntry {
                optional: true,
                ..entry("fsevents", DependencyType::RegistryPackage)
            }),
        ];

        let mut options = ResolveOptions::new(temp.path());
        options.skip_dev = true;
        options.include_optional = false;
        let graph = resolver().resolve(&specs, &options).await;
        assert_eq!(graph.resolved.len(), 1);
        assert!(graph.resolved[0].path.ends_with("vendor/left-pad"));
        assert!(graph.missing.is_empty());

        let mut options = ResolveOptions::new(temp.path());
        options.include_optional = true;
        let graph = resolver().resolve(&specs, &options).await;
        assert_eq!(graph.missing.len(), 2);
        assert!(graph.missing.iter().any(|m| m.optional));
    }

    #[tokio::test]
    async fn test_optional_dependencies_skipped_by_default() {
        let temp = TempDir::new().unwrap();
        let options = ResolveOptions::new(temp.path());
        assert!(!options.include_optional);
        assert!(!options.skip_dev);

        let specs = vec![
            DependencySpec::Simple("required".to_string()),
            DependencySpec::Detailed(DependencyEntry {
                optional: true,
                ..entry("fsevents", DependencyType::RegistryPackage)
            }),
        ];
        let graph = resolver().resolve(&specs, &options).await;
        assert_eq!(graph.missing.len(), 1);
        assert_eq!(graph.missing[0].name, "required");
    }

    #[tokio::test]
    async fn test_local_dependency_outside_allowed_paths() {
        let temp = TempDir::new().unwrap();
        let specs = vec![
            DependencySpec::Detailed(DependencyEntry {
                url: Some("/etc".to_string()),
                ..entry("system", DependencyType::Local)
            }),
            DependencySpec::Detailed(DependencyEntry {
                url: Some("file:///etc/ssl".to_string()),
                ..entry("certs", DependencyType::Local)
            }),
        ];
        let graph = resolver().resolve(&specs, &ResolveOptions::new(temp.path())).await;
        assert!(graph.resolved.is_empty());
        assert_eq!(graph.missing.len(), 2);
        assert!(
            graph.missing.iter().all(|m| m.reason.contains("not allowed")),
            "{:?}",
            graph.missing
        );
    }

    #[tokio::test]
    async fn test_registry_names_cannot_escape_install_dir() {
        let temp = TempDir::new().unwrap();
        install(temp.path(), "real", "1.0.0");
        // A package.json two levels above node_modules/real
        std::fs::write(temp.path().join("package.json"), r#"{"version":"9.9.9"}"#).unwrap();

        let specs = vec![
            DependencySpec::Detailed(entry("../", DependencyType::RegistryPackage)),
            DependencySpec::Detailed(entry("real/../..", DependencyType::RegistryPackage)),
            DependencySpec::Detailed(entry("/etc", DependencyType::RegistryPackage)),
            DependencySpec::Simple("real".to_string()),
        ];
        let graph = resolver().resolve(&specs, &ResolveOptions::new(temp.path())).await;

        assert_eq!(graph.resolved.len(), 1);
        assert_eq!(graph.resolved[0].dependency.name, "real");
        assert_eq!(graph.missing.len(), 3);
        assert!(graph.missing.iter().all(|m| m.reason.contains("invalid package name")));

        assert!(is_valid_package_name("@scope/pkg"));
        assert!(!is_valid_package_name("./pkg"));
        assert!(!is_valid_package_name(""));
    }

    #[tokio::test]
    async fn test_all_required_failed() {
        let temp = TempDir::new().unwrap();
        let specs = vec![
            DependencySpec::Simple("a".to_string()),
            DependencySpec::Detailed(DependencyEntry {
                url: Some("acme/templates".to_string()),
                ..entry("templates", DependencyType::Repository)
            }),
        ];
        let graph = resolver().resolve(&specs, &ResolveOptions::new(temp.path())).await;
        assert!(graph.resolved.is_empty());
        assert!(graph.all_required_failed());
        assert!(graph.missing.iter().any(|m| m.reason.contains("No resolver")));
    }
}
