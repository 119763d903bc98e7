//! Security utilities for path validation and remote access control
//!
//! This module provides the checks the resolution manager and the resolvers
//! run before touching the file system or the network: a blacklist of
//! sensitive system directories for local references, and a URL policy
//! (secure transport, domain allow/block lists) for remote ones.

use std::path::Path;
use url::Url;

use crate::config::SecurityConfig;

/// Security blacklist for local paths
/// Prevents access to sensitive system directories while allowing normal development paths
pub static BLACKLISTED_PATHS: &[&str] = &[
    "/etc",                    // System configuration
    "/sys",                    // System information
    "/proc",                   // Process information
    "/dev",                    // Device files
    "/boot",                   // Boot files
    "/bin",                    // System binaries
    "/sbin",                   // System binaries
    "/usr/bin",                // User binaries
    "/usr/sbin",               // User system binaries
    "/System",                 // macOS system
    "/Library",                // macOS system libraries
    "/private/etc",            // macOS etc
    "/private/var/db",         // macOS system databases
    "C:\\Windows",             // Windows system
    "C:\\Program Files",       // Windows programs
    "C:\\Program Files (x86)", // Windows 32-bit programs
    "C:\\ProgramData",         // Windows program data
];

/// Check if a path is blacklisted (points to sensitive system directories)
///
/// # Examples
/// ```
/// use tplkit::utils::security::is_path_blacklisted;
/// use std::path::Path;
///
/// assert!(is_path_blacklisted(Path::new("/etc/passwd")));
/// assert!(!is_path_blacklisted(Path::new("/home/user/templates")));
/// ```
#[must_use]
pub fn is_path_blacklisted(path: &Path) -> bool {
    BLACKLISTED_PATHS.iter().any(|blacklisted| path.starts_with(blacklisted))
}

/// Validates a local template path for security constraints.
///
/// # Errors
///
/// Returns a description of the violated rule when the path is blacklisted.
pub fn validate_path_security(path: &Path) -> Result<(), String> {
    if is_path_blacklisted(path) {
        return Err(format!("access to system directory {} is not allowed", path.display()));
    }
    Ok(())
}

/// Whether `host` equals `domain` or is one of its subdomains.
fn host_matches(host: &str, domain: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    let domain = domain.trim_start_matches("*.").trim_end_matches('.').to_ascii_lowercase();
    host == domain || host.ends_with(&format!(".{domain}"))
}

/// Validates a remote URL against the security policy.
///
/// Checks, in order: the scheme is `http`/`https`, secure transport when
/// required, no embedded credentials, the block list, then the allow list
/// (an empty allow list permits every domain not blocked).
///
/// # Errors
///
/// Returns a description of the violated rule.
///
/// # Examples
/// ```
/// use tplkit::config::SecurityConfig;
/// use tplkit::utils::security::validate_url_policy;
///
/// let policy = SecurityConfig::default();
/// assert!(validate_url_policy("https://example.com/t.yaml", &policy).is_ok());
/// assert!(validate_url_policy("http://example.com/t.yaml", &policy).is_err());
/// ```
pub fn validate_url_policy(raw: &str, policy: &SecurityConfig) -> Result<Url, String> {
    let url = Url::parse(raw).map_err(|e| format!("invalid URL: {e}"))?;

    match url.scheme() {
        "https" => {}
        "http" if !policy.require_https => {}
        "http" => return Err("insecure transport (http) is not allowed; use https".to_string()),
        other => return Err(format!("unsupported URL scheme '{other}'")),
    }

    if !url.username().is_empty() || url.password().is_some() {
        return Err("credentials embedded in URLs are not allowed".to_string());
    }

    let host = url.host_str().ok_or_else(|| "URL has no host".to_string())?;

    if let Some(blocked) = policy.blocked_domains.iter().find(|d| host_matches(host, d)) {
        return Err(format!("domain '{host}' is blocked (matches '{blocked}')"));
    }

    if !policy.allowed_domains.is_empty()
        && !policy.allowed_domains.iter().any(|d| host_matches(host, d))
    {
        return Err(format!("domain '{host}' is not in the allowed domain list"));
    }

    Ok(url)
}
