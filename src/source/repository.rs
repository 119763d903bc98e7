//! Hosted repository references.
//!
//! Accepted forms:
//!
//! - `owner/repo`, `owner/repo@ref`, `owner/repo@ref/path/to/template`
//! - `github:owner/repo[@ref][/path]`
//! - `https://github.com/owner/repo[/tree|blob/<ref>/<path>]`
//! - `https://raw.githubusercontent.com/owner/repo/<ref>/<path>`
//!
//! The reference is turned into a raw-content URL and fetched through the
//! [`SecureFetcher`]. A path that does not name a YAML file is treated as a
//! template directory and gets the conventional descriptor name appended.

use chrono::Utc;
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;
use url::Url;

use super::fetch::{SecureFetcher, materialize};
use super::{ResolvedTemplate, SourceType, TemplateMetadata};
use crate::config::RepositoryConfig;
use crate::constants::MATERIALIZED_DESCRIPTOR_NAME;
use crate::core::ResolutionError;
use crate::utils::fs::checksum;

const SCHEME_PREFIX: &str = "github:";

static SHORTHAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9-]*/[A-Za-z0-9._-]+(?:@[^/\s]+)?(?:/\S*)?$")
        .expect("static regex")
});
static OWNER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9](?:[A-Za-z0-9-]{0,38})$").expect("static regex"));
static REPO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]{1,100}$").expect("static regex"));
static GIT_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._/-]{1,255}$").expect("static regex"));

/// The components of a repository reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryReference {
    pub owner: String,
    pub repo: String,
    pub git_ref: Option<String>,
    pub path: Option<String>,
}

impl RepositoryReference {
    /// Check every component against the allowed character sets.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid component.
    pub fn validate(&self) -> Result<(), String> {
        if !OWNER.is_match(&self.owner) {
            return Err(format!("invalid owner '{}'", self.owner));
        }
        if !REPO.is_match(&self.repo) || self.repo == "." || self.repo == ".." {
            return Err(format!("invalid repository name '{}'", self.repo));
        }
        if let Some(git_ref) = &self.git_ref
            && (!GIT_REF.is_match(git_ref) || git_ref.contains("..") || git_ref.starts_with('-'))
        {
            return Err(format!("invalid ref '{git_ref}'"));
        }
        if let Some(path) = &self.path
            && (path.split('/').any(|segment| segment == "..") || path.contains('\\'))
        {
            return Err(format!("path '{path}' escapes the repository"));
        }
        Ok(())
    }

    /// Path of the descriptor file inside the repository.
    #[must_use]
    pub fn descriptor_path(&self) -> String {
        match self.path.as_deref().map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
            Some(p) if p.ends_with(".yaml") || p.ends_with(".yml") => p.to_string(),
            Some(p) => format!("{p}/{MATERIALIZED_DESCRIPTOR_NAME}"),
            None => MATERIALIZED_DESCRIPTOR_NAME.to_string(),
        }
    }
}

impl fmt::Display for RepositoryReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)?;
        if let Some(git_ref) = &self.git_ref {
            write!(f, "@{git_ref}")?;
        }
        if let Some(path) = &self.path {
            write!(f, "/{}", path.trim_matches('/'))?;
        }
        Ok(())
    }
}

fn is_repository_host(host: &str, config: &RepositoryConfig) -> bool {
    let web = config.host.to_ascii_lowercase();
    host == web || host == format!("www.{web}")
}

fn is_raw_url(url: &Url, config: &RepositoryConfig) -> bool {
    let Ok(raw_base) = Url::parse(&config.raw_base_url) else {
        return false;
    };
    url.host_str() == raw_base.host_str()
        && url.port_or_known_default() == raw_base.port_or_known_default()
        && url.path().starts_with(raw_base.path().trim_end_matches('/'))
}

/// Whether the reference uses one of the repository forms.
#[must_use]
pub fn is_repository_reference(reference: &str, config: &RepositoryConfig) -> bool {
    let r = reference.trim();
    if r.starts_with(SCHEME_PREFIX) {
        return true;
    }
    if r.starts_with("http://") || r.starts_with("https://") {
        return Url::parse(r).is_ok_and(|url| {
            url.host_str().is_some_and(|h| is_repository_host(&h.to_ascii_lowercase(), config))
                || is_raw_url(&url, config)
        });
    }
    SHORTHAND.is_match(r)
}

fn parse_shorthand(raw: &str) -> Result<RepositoryReference, String> {
    let (owner, rest) = raw.split_once('/').ok_or("expected owner/repo")?;
    let (repo_part, path) = match rest.split_once('/') {
        Some((repo, path)) => (repo, Some(path.to_string())),
        None => (rest, None),
    };
    let (repo, git_ref) = match repo_part.split_once('@') {
        Some((repo, git_ref)) => (repo, Some(git_ref.to_string())),
        None => (repo_part, None),
    };
    Ok(RepositoryReference {
        owner: owner.to_string(),
        repo: repo.trim_end_matches(".git").to_string(),
        git_ref: git_ref.filter(|r| !r.is_empty()),
        path: path.filter(|p| !p.is_empty()),
    })
}

fn segments(url: &Url) -> Vec<String> {
    url.path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).map(str::to_string).collect())
        .unwrap_or_default()
}

/// Fetches templates from a hosted repository's raw-content endpoint.
#[derive(Debug, Clone)]
pub struct RepositoryResolver {
    config: RepositoryConfig,
    fetcher: SecureFetcher,
}

impl RepositoryResolver {
    #[must_use]
    pub const fn new(config: RepositoryConfig, fetcher: SecureFetcher) -> Self {
        Self {
            config,
            fetcher,
        }
    }

    #[must_use]
    pub fn supports(&self, reference: &str) -> bool {
        is_repository_reference(reference, &self.config)
    }

    /// Split a reference into its components and validate them.
    ///
    /// # Errors
    ///
    /// Returns a description of why the reference is not a valid
    /// repository reference.
    pub fn parse(&self, reference: &str) -> Result<RepositoryReference, String> {
        let r = reference.trim();

        let parsed = if let Some(rest) = r.strip_prefix(SCHEME_PREFIX) {
            parse_shorthand(rest.trim_start_matches('/'))?
        } else if r.starts_with("http://") || r.starts_with("https://") {
            let url = Url::parse(r).map_err(|e| format!("invalid URL: {e}"))?;
            if is_raw_url(&url, &self.config) {
                let base_depth = Url::parse(&self.config.raw_base_url)
                    .map(|u| segments(&u).len())
                    .unwrap_or(0);
                let segs: Vec<String> = segments(&url).into_iter().skip(base_depth).collect();
                if segs.len() < 4 {
                    return Err("raw-content URLs need owner/repo/ref/path".to_string());
                }
                RepositoryReference {
                    owner: segs[0].clone(),
                    repo: segs[1].clone(),
                    git_ref: Some(segs[2].clone()),
                    path: Some(segs[3..].join("/")),
                }
            } else {
                let segs = segments(&url);
                if segs.len() < 2 {
                    return Err("expected a URL of the form https://host/owner/repo".to_string());
                }
                let (git_ref, path) = match segs.get(2).map(String::as_str) {
                    Some("tree" | "blob") if segs.len() >= 4 => {
                        let path = segs[4..].join("/");
                        (Some(segs[3].clone()), (!path.is_empty()).then_some(path))
                    }
                    Some(_) => (None, Some(segs[2..].join("/"))),
                    None => (None, None),
                };
                RepositoryReference {
                    owner: segs[0].clone(),
                    repo: segs[1].trim_end_matches(".git").to_string(),
                    git_ref,
                    path,
                }
            }
        } else {
            parse_shorthand(r)?
        };

        parsed.validate()?;
        Ok(parsed)
    }

    /// Canonical `github:owner/repo@ref/path` form with the default ref filled in.
    #[must_use]
    pub fn normalize(&self, reference: &str) -> String {
        match self.parse(reference) {
            Ok(mut parsed) => {
                if parsed.git_ref.is_none() {
                    parsed.git_ref = Some(self.config.default_ref.clone());
                }
                parsed.path = Some(parsed.descriptor_path());
                format!("{SCHEME_PREFIX}{parsed}")
            }
            Err(_) => reference.trim().to_string(),
        }
    }

    /// Raw-content URL for a parsed reference.
    #[must_use]
    pub fn raw_url(&self, parsed: &RepositoryReference) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.config.raw_base_url.trim_end_matches('/'),
            parsed.owner,
            parsed.repo,
            parsed.git_ref.as_deref().unwrap_or(&self.config.default_ref),
            parsed.descriptor_path()
        )
    }

    /// Fetch the referenced descriptor and materialize it locally.
    ///
    /// # Errors
    ///
    /// Returns [`ResolutionError::InvalidReference`] for malformed
    /// references and any error of [`SecureFetcher::fetch_text`].
    pub async fn resolve(&self, reference: &str) -> Result<ResolvedTemplate, ResolutionError> {
        let parsed = self.parse(reference).map_err(|reason| ResolutionError::InvalidReference {
            reference: reference.to_string(),
            resolver: SourceType::Repository,
            reason,
        })?;

        let url = self.raw_url(&parsed);
        let content = self.fetcher.fetch_text(reference, &url, SourceType::Repository).await?;

        let base_path = materialize(&content).await.map_err(|e| ResolutionError::FetchFailed {
            reference: reference.to_string(),
            resolver: SourceType::Repository,
            cause: format!("{e:#}"),
        })?;

        let metadata = TemplateMetadata {
            reference: reference.to_string(),
            source_type: SourceType::Repository,
            version: Some(parsed.git_ref.unwrap_or_else(|| self.config.default_ref.clone())),
            fetch_timestamp: Utc::now(),
            checksum: checksum(content.as_bytes()),
            source_path: None,
        };

        Ok(ResolvedTemplate::new(content, base_path, metadata))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityConfig;

    fn resolver() -> RepositoryResolver {
        RepositoryResolver::new(
            RepositoryConfig::default(),
            SecureFetcher::new(SecurityConfig::default()).unwrap(),
        )
    }

    #[test]
    fn test_parse_shorthand_forms() {
        let r = resolver();
        assert_eq!(
            r.parse("acme/templates").unwrap(),
            RepositoryReference {
                owner: "acme".to_string(),
                repo: "templates".to_string(),
                git_ref: None,
                path: None,
            }
        );

        let full = r.parse("acme/templates@v2.1.0/react/app").unwrap();
        assert_eq!(full.git_ref.as_deref(), Some("v2.1.0"));
        assert_eq!(full.path.as_deref(), Some("react/app"));

        let prefixed = r.parse("github:acme/templates/node").unwrap();
        assert_eq!(prefixed.path.as_deref(), Some("node"));
    }

    #[test]
    fn test_parse_urls() {
        let r = resolver();
        let tree = r.parse("https://github.com/acme/templates/tree/dev/react").unwrap();
        assert_eq!(tree.git_ref.as_deref(), Some("dev"));
        assert_eq!(tree.path.as_deref(), Some("react"));

        let bare = r.parse("https://github.com/acme/templates.git").unwrap();
        assert_eq!(bare.repo, "templates");
        assert_eq!(bare.git_ref, None);

        let raw = r
            .parse("https://raw.githubusercontent.com/acme/templates/main/react/template.yaml")
            .unwrap();
        assert_eq!(raw.git_ref.as_deref(), Some("main"));
        assert_eq!(raw.path.as_deref(), Some("react/template.yaml"));
    }

    #[test]
    fn test_rejects_invalid_components() {
        let r = resolver();
        assert!(r.parse("acme/templates/../../etc").is_err());
        assert!(r.parse("acme/templates@-bad").is_err());
        assert!(r.parse("acme/templates@a..b").is_err());
        assert!(r.parse("-acme/templates").is_err());
        assert!(r.parse("https://github.com/acme").is_err());
    }

    #[test]
    fn test_raw_url_and_descriptor_path() {
        let r = resolver();
        let parsed = r.parse("acme/templates@v1/react").unwrap();
        assert_eq!(
            r.raw_url(&parsed),
            "https://raw.githubusercontent.com/acme/templates/v1/react/template.yaml"
        );

        let parsed = r.parse("acme/templates").unwrap();
        assert_eq!(
            r.raw_url(&parsed),
            "https://raw.githubusercontent.com/acme/templates/main/template.yaml"
        );

        let parsed = r.parse("acme/templates/custom.yml").unwrap();
        assert_eq!(parsed.descriptor_path(), "custom.yml");
    }

    #[test]
    fn test_normalize_equates_spellings() {
        let r = resolver();
        assert_eq!(r.normalize("acme/templates"), "github:acme/templates@main/template.yaml");
        assert_eq!(r.normalize("acme/templates"), r.normalize("github:acme/templates@main"));
        assert_eq!(
            r.normalize("https://github.com/acme/templates/tree/main/react"),
            r.normalize("acme/templates@main/react/template.yaml")
        );
    }

    #[test]
    fn test_is_repository_reference() {
        let config = RepositoryConfig::default();
        assert!(is_repository_reference("acme/templates", &config));
        assert!(is_repository_reference("https://www.github.com/acme/t", &config));
        assert!(!is_repository_reference("https://gitlab.com/acme/t", &config));
        assert!(!is_repository_reference("@scope/name", &config));
        assert!(!is_repository_reference("./acme/templates", &config));
    }
}
