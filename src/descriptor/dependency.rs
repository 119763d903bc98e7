//! Dependency entries as declared in a descriptor and their normalized form.
//!
//! A descriptor lists dependencies either as strings (`lodash`,
//! `react@^18.0.0`, `@scope/pkg@1.2.0`) or as objects with an explicit
//! type and location. [`DependencySpec::normalize`] turns both into a
//! [`Dependency`]; string entries are always registry packages.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Where a dependency comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DependencyType {
    /// A package installed by the project's package manager
    RegistryPackage,
    /// A hosted repository reference
    Repository,
    /// A path on the local filesystem
    Local,
    /// A plain HTTP(S) URL
    Http,
}

impl DependencyType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RegistryPackage => "registry-package",
            Self::Repository => "repository",
            Self::Local => "local",
            Self::Http => "http",
        }
    }
}

impl fmt::Display for DependencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DependencyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "registry-package" | "npm" | "package" => Ok(Self::RegistryPackage),
            "repository" | "github" | "git" => Ok(Self::Repository),
            "local" | "path" => Ok(Self::Local),
            "http" | "https" | "url" => Ok(Self::Http),
            other => Err(format!("unknown dependency type '{other}'")),
        }
    }
}

/// Object form of a dependency entry; `type` may be omitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub dep_type: Option<DependencyType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub dev: bool,
}

/// A dependency as written in the descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependencySpec {
    /// `name` or `name@version`
    Simple(String),
    Detailed(DependencyEntry),
}

/// A normalized dependency, ready for resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(rename = "type")]
    pub dep_type: DependencyType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub optional: bool,
    pub dev: bool,
}

impl Dependency {
    /// The reference a resolver is asked for: the explicit URL, else the name.
    #[must_use]
    pub fn reference(&self) -> &str {
        self.url.as_deref().unwrap_or(&self.name)
    }
}

/// Split `name@version`, keeping a leading scope marker (`@scope/name`).
fn split_name_version(raw: &str) -> (String, Option<String>) {
    let raw = raw.trim();
    match raw.rfind('@') {
        Some(index) if index > 0 => {
            let version = raw[index + 1..].trim();
            let version = (!version.is_empty()).then(|| version.to_string());
            (raw[..index].to_string(), version)
        }
        _ => (raw.to_string(), None),
    }
}

impl DependencySpec {
    /// Name of the dependency without any version suffix.
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::Simple(raw) => split_name_version(raw).0,
            Self::Detailed(entry) => entry.name.clone(),
        }
    }

    /// Normalize into a full [`Dependency`].
    ///
    /// ```
    /// use tplkit::descriptor::{DependencySpec, DependencyType};
    ///
    /// let dep = DependencySpec::Simple("@acme/ui@^2.0.0".to_string()).normalize();
    /// assert_eq!(dep.name, "@acme/ui");
    /// assert_eq!(dep.version.as_deref(), Some("^2.0.0"));
    /// assert_eq!(dep.dep_type, DependencyType::RegistryPackage);
    /// ```
    #[must_use]
    pub fn normalize(&self) -> Dependency {
        match self {
            Self::Simple(raw) => {
                let (name, version) = split_name_version(raw);
                Dependency {
                    name,
                    version,
                    dep_type: DependencyType::RegistryPackage,
                    url: None,
                    optional: false,
                    dev: false,
                }
            }
            Self::Detailed(entry) => Dependency {
                name: entry.name.clone(),
                version: entry.version.clone(),
                dep_type: entry.dep_type.unwrap_or(DependencyType::RegistryPackage),
                url: entry.url.clone(),
                optional: entry.optional,
                dev: entry.dev,
            },
        }
    }
}

impl From<Dependency> for DependencySpec {
    fn from(dep: Dependency) -> Self {
        Self::Detailed(DependencyEntry {
            name: dep.name,
            version: dep.version,
            dep_type: Some(dep.dep_type),
            url: dep.url,
            optional: dep.optional,
            dev: dep.dev,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_name() {
        let dep = DependencySpec::Simple("lodash".to_string()).normalize();
        assert_eq!(dep.name, "lodash");
        assert_eq!(dep.version, None);
        assert_eq!(dep.dep_type, DependencyType::RegistryPackage);
        assert!(!dep.optional && !dep.dev);
    }

    #[test]
    fn test_name_with_version() {
        let dep = DependencySpec::Simple("react@^18.0.0".to_string()).normalize();
        assert_eq!(dep.name, "react");
        assert_eq!(dep.version.as_deref(), Some("^18.0.0"));

        let scoped = DependencySpec::Simple("@scope/pkg".to_string()).normalize();
        assert_eq!(scoped.name, "@scope/pkg");
        assert_eq!(scoped.version, None);

        let trailing = DependencySpec::Simple("pkg@".to_string()).normalize();
        assert_eq!(trailing.name, "pkg");
        assert_eq!(trailing.version, None);
    }

    #[test]
    fn test_detailed_defaults_to_registry_package() {
        let spec: DependencySpec =
            serde_yaml::from_str("name: left-pad\nversion: '1.3.0'\ndev: true").unwrap();
        let dep = spec.normalize();
        assert_eq!(dep.dep_type, DependencyType::RegistryPackage);
        assert!(dep.dev);
        assert_eq!(dep.reference(), "left-pad");
    }

    #[test]
    fn test_detailed_local() {
        let spec: DependencySpec =
            serde_yaml::from_str("name: left-pad\ntype: local\nurl: ./vendor/left-pad").unwrap();
        let dep = spec.normalize();
        assert_eq!(dep.dep_type, DependencyType::Local);
        assert_eq!(dep.reference(), "./vendor/left-pad");
    }

    #[test]
    fn test_dependency_type_aliases() {
        assert_eq!("npm".parse::<DependencyType>().unwrap(), DependencyType::RegistryPackage);
        assert_eq!("github".parse::<DependencyType>().unwrap(), DependencyType::Repository);
        assert!("ftp".parse::<DependencyType>().is_err());
    }
}
