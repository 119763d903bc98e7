//! Error handling for tplkit
//!
//! This module provides the typed error taxonomy of the resolution core and the
//! user-friendly error reporting used by the driver binary. The error system is
//! designed around two principles:
//! 1. **Strongly-typed errors** so callers can branch on precise failure modes
//! 2. **Displayable context** so every error can be shown without further lookup
//!
//! # Error Categories
//!
//! - [`TemplateConfigError`] - descriptor missing, unreadable or malformed. Field
//!   level validation problems are *not* errors; they are accumulated in
//!   [`crate::descriptor::ParsedTemplate`].
//! - [`ResolutionError`] - a reference could not be classified, routed, fetched,
//!   or was rejected by the security policy. Always carries the reference.
//! - [`CompositionError`] - an inclusion aborted under the `fail`/`error`
//!   strategies, a circular composition, or a nested resolution failure.
//! - [`TemplateError`] - umbrella type with `From` conversions for the above.
//!
//! Cache integrity failures never surface as errors (they behave as a miss) and
//! dependency problems are reported as data in
//! [`crate::resolver::DependencyGraph`].
//!
//! # Examples
//!
//! ```rust,no_run
//! use tplkit::core::{ResolutionError, user_friendly_error};
//! use tplkit::source::SourceType;
//!
//! let error = ResolutionError::PayloadTooLarge {
//!     reference: "acme/templates".to_string(),
//!     resolver: SourceType::Repository,
//!     limit: 1024,
//! };
//! let ctx = user_friendly_error(anyhow::Error::from(error));
//! ctx.display(); // Shows colored error with suggestions
//! ```

use colored::Colorize;
use std::fmt;
use thiserror::Error;

use crate::compose::{ConflictKind, ConflictStrategy};
use crate::source::SourceType;

/// A descriptor could not be loaded at all.
///
/// Returned immediately by the parser; the call cannot recover from it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateConfigError {
    /// No descriptor exists at the given location
    #[error("Template descriptor not found: {path}")]
    NotFound {
        /// Path that was searched (file or template directory)
        path: String,
    },

    /// The descriptor exists but could not be read
    #[error("Failed to read template descriptor {path}: {reason}")]
    ReadFailed {
        /// Path of the descriptor file
        path: String,
        /// Underlying I/O failure
        reason: String,
    },

    /// The document is not well-formed structured data
    #[error("Malformed template descriptor in {origin}: {reason}")]
    Malformed {
        /// File path or other label identifying where the text came from
        origin: String,
        /// Parser diagnostic
        reason: String,
    },
}

/// A reference could not be turned into a [`crate::source::ResolvedTemplate`].
///
/// Every variant carries the offending reference; variants produced by a
/// specific resolver also carry its [`SourceType`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    /// The reference syntax matches no known source type
    #[error("Cannot determine the source type of reference '{reference}'")]
    Unclassifiable {
        /// The reference as supplied
        reference: String,
    },

    /// No registered resolver accepts the reference
    #[error("No resolver supports reference '{reference}'")]
    NoResolver {
        /// The reference as supplied
        reference: String,
    },

    /// The reference is syntactically unusable for the selected resolver
    #[error("Invalid {resolver} reference '{reference}': {reason}")]
    InvalidReference {
        /// The reference as supplied
        reference: String,
        /// Resolver that rejected it
        resolver: SourceType,
        /// What is wrong with it
        reason: String,
    },

    /// The referenced template does not exist
    #[error("{resolver} resolver could not find '{reference}' (looked at {location})")]
    NotFound {
        /// The reference as supplied
        reference: String,
        /// Resolver that searched for it
        resolver: SourceType,
        /// Path or URL that was checked
        location: String,
    },

    /// The fetch failed for a transport or I/O reason
    #[error("{resolver} resolver failed for '{reference}': {cause}")]
    FetchFailed {
        /// The reference as supplied
        reference: String,
        /// Resolver that attempted the fetch
        resolver: SourceType,
        /// Underlying cause
        cause: String,
    },

    /// The remote answered with a non-success status
    #[error("HTTP {status} fetching '{reference}' from {url}")]
    HttpStatus {
        /// The reference as supplied
        reference: String,
        /// Resolver that attempted the fetch
        resolver: SourceType,
        /// Concrete URL that was requested
        url: String,
        /// HTTP status code
        status: u16,
    },

    /// The fetch exceeded its hard timeout
    #[error("Timed out after {timeout_secs}s fetching '{reference}'")]
    Timeout {
        /// The reference as supplied
        reference: String,
        /// Resolver that attempted the fetch
        resolver: SourceType,
        /// Configured timeout
        timeout_secs: u64,
    },

    /// The security policy refused the reference before or during fetching
    #[error("Security policy rejected '{reference}': {reason}")]
    SecurityViolation {
        /// The reference as supplied
        reference: String,
        /// Resolver involved, if routing had already happened
        resolver: Option<SourceType>,
        /// Which rule was violated
        reason: String,
    },

    /// The payload grew past the configured byte limit mid-stream
    #[error("Payload for '{reference}' exceeds the maximum size of {limit} bytes")]
    PayloadTooLarge {
        /// The reference as supplied
        reference: String,
        /// Resolver that attempted the fetch
        resolver: SourceType,
        /// Configured maximum in bytes
        limit: u64,
    },
}

impl ResolutionError {
    /// The reference this error is about.
    #[must_use]
    pub fn reference(&self) -> &str {
        match self {
            Self::Unclassifiable {
                reference,
            }
            | Self::NoResolver {
                reference,
            }
            | Self::InvalidReference {
                reference,
                ..
            }
            | Self::NotFound {
                reference,
                ..
            }
            | Self::FetchFailed {
                reference,
                ..
            }
            | Self::HttpStatus {
                reference,
                ..
            }
            | Self::Timeout {
                reference,
                ..
            }
            | Self::SecurityViolation {
                reference,
                ..
            }
            | Self::PayloadTooLarge {
                reference,
                ..
            } => reference,
        }
    }

    /// The resolver involved, if routing had selected one.
    #[must_use]
    pub const fn resolver(&self) -> Option<SourceType> {
        match self {
            Self::Unclassifiable {
                ..
            }
            | Self::NoResolver {
                ..
            } => None,
            Self::SecurityViolation {
                resolver,
                ..
            } => *resolver,
            Self::InvalidReference {
                resolver,
                ..
            }
            | Self::NotFound {
                resolver,
                ..
            }
            | Self::FetchFailed {
                resolver,
                ..
            }
            | Self::HttpStatus {
                resolver,
                ..
            }
            | Self::Timeout {
                resolver,
                ..
            }
            | Self::PayloadTooLarge {
                resolver,
                ..
            } => Some(*resolver),
        }
    }

    /// Whether the failure came from the security policy (including the size limit).
    #[must_use]
    pub const fn is_security_violation(&self) -> bool {
        matches!(
            self,
            Self::SecurityViolation {
                ..
            } | Self::PayloadTooLarge {
                ..
            }
        )
    }
}

/// Composition of `extends`/`includes` was aborted.
#[derive(Error, Debug, Clone)]
pub enum CompositionError {
    /// A collision occurred under a strategy that does not resolve it
    #[error("Conflicting {kind} '{name}' from '{source_ref}' (strategy: {strategy})")]
    Conflict {
        /// What collided
        kind: ConflictKind,
        /// Name of the colliding entry
        name: String,
        /// Reference of the template that introduced the collision
        source_ref: String,
        /// Strategy in effect
        strategy: ConflictStrategy,
    },

    /// A parent or included template could not be resolved
    #[error("Failed to resolve '{reference}' during composition")]
    Resolution {
        /// The `extends` or include reference
        reference: String,
        /// Underlying resolution failure
        #[source]
        source: ResolutionError,
    },

    /// A parent or included template was fetched but is not a valid descriptor
    #[error("Template '{reference}' is not a valid descriptor: {}", errors.join("; "))]
    InvalidTemplate {
        /// The `extends` or include reference
        reference: String,
        /// Fatal validation errors or the load failure
        errors: Vec<String>,
    },

    /// An include condition could not be evaluated
    #[error("Invalid condition '{expression}' on include '{reference}': {reason}")]
    Condition {
        /// The include reference
        reference: String,
        /// The condition text
        expression: String,
        /// Parser or evaluator diagnostic
        reason: String,
    },

    /// A template (transitively) extends or includes itself
    #[error("Circular composition detected: {}", chain.join(" → "))]
    CircularComposition {
        /// References on the composition stack, closing with the repeated one
        chain: Vec<String>,
    },

    /// Nesting went past the configured maximum depth
    #[error("Composition depth limit of {max_depth} exceeded at '{reference}'")]
    DepthExceeded {
        /// Reference at which the limit was hit
        reference: String,
        /// Configured limit
        max_depth: usize,
    },
}

/// Umbrella error for callers that do not need to distinguish the stages.
#[derive(Error, Debug, Clone)]
pub enum TemplateError {
    /// Loading a descriptor failed
    #[error(transparent)]
    Config(#[from] TemplateConfigError),

    /// Resolving a reference failed
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    /// Composing a template failed
    #[error(transparent)]
    Composition(#[from] CompositionError),

    /// A descriptor loaded but failed validation
    #[error("Template '{name}' failed validation with {} error(s)", errors.len())]
    InvalidDescriptor {
        /// Descriptor name, or its origin when the name is missing
        name: String,
        /// Fatal validation errors
        errors: Vec<String>,
    },

    /// The tplkit configuration file is unusable
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the problem
        message: String,
    },

    /// File system failure outside of a specific resolver
    #[error("I/O error: {message}")]
    Io {
        /// Rendered I/O error
        message: String,
    },

    /// Anything else
    #[error("{message}")]
    Other {
        /// Error message
        message: String,
    },
}

impl From<std::io::Error> for TemplateError {
    fn from(error: std::io::Error) -> Self {
        Self::Io {
            message: error.to_string(),
        }
    }
}

/// Error plus optional details and suggestion, for terminal display.
#[derive(Debug)]
pub struct ErrorContext {
    /// The underlying error
    pub error: TemplateError,
    /// Optional suggestion for resolving the error
    pub suggestion: Option<String>,
    /// Optional additional details about the error
    pub details: Option<String>,
}

impl ErrorContext {
    /// Create a new error context with no suggestion or details.
    #[must_use]
    pub const fn new(error: TemplateError) -> Self {
        Self {
            error,
            suggestion: None,
            details: None,
        }
    }

    /// Add an actionable suggestion (displayed in green).
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Add explanatory details (displayed in yellow).
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Print the error, details and suggestion to stderr with terminal colors.
    pub fn display(&self) {
        eprintln!("{}: {}", "error".red().bold(), self.error);

        if let TemplateError::InvalidDescriptor {
            errors,
            ..
        } = &self.error
        {
            for error in errors {
                eprintln!("  {} {}", "-".red(), error);
            }
        }

        if let Some(details) = &self.details {
            eprintln!("{}: {}", "details".yellow(), details);
        }

        if let Some(suggestion) = &self.suggestion {
            eprintln!("{}: {}", "suggestion".green(), suggestion);
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;

        if let Some(details) = &self.details {
            write!(f, "\nDetails: {details}")?;
        }

        if let Some(suggestion) = &self.suggestion {
            write!(f, "\nSuggestion: {suggestion}")?;
        }

        Ok(())
    }
}

impl std::error::Error for ErrorContext {}

/// Convert any error to a user-friendly [`ErrorContext`] with actionable suggestions.
///
/// Recognizes the typed errors of this crate (directly or wrapped in
/// [`TemplateError`]) and [`std::io::Error`]; anything else is rendered with
/// its full `anyhow` context chain.
pub fn user_friendly_error(error: anyhow::Error) -> ErrorContext {
    if let Some(template_error) = error.downcast_ref::<TemplateError>() {
        return create_error_context(template_error.clone());
    }
    if let Some(config_error) = error.downcast_ref::<TemplateConfigError>() {
        return create_error_context(TemplateError::Config(config_error.clone()));
    }
    if let Some(resolution_error) = error.downcast_ref::<ResolutionError>() {
        return create_error_context(TemplateError::Resolution(resolution_error.clone()));
    }
    if let Some(composition_error) = error.downcast_ref::<CompositionError>() {
        return create_error_context(TemplateError::Composition(composition_error.clone()));
    }

    if let Some(io_error) = error.downcast_ref::<std::io::Error>() {
        let context = ErrorContext::new(TemplateError::Io {
            message: io_error.to_string(),
        });
        return match io_error.kind() {
            std::io::ErrorKind::PermissionDenied => context
                .with_suggestion("Check file ownership and permissions of the template and cache directories"),
            std::io::ErrorKind::NotFound => {
                context.with_suggestion("Check that the file or directory exists and the path is correct")
            }
            _ => context,
        };
    }

    ErrorContext::new(TemplateError::Other {
        message: format!("{error:#}"),
    })
}

fn create_error_context(error: TemplateError) -> ErrorContext {
    match &error {
        TemplateError::Config(TemplateConfigError::NotFound {
            ..
        }) => ErrorContext::new(error).with_suggestion(
            "Pass the path to a template.yaml file or to a directory that contains one",
        ),
        TemplateError::Config(TemplateConfigError::Malformed {
            ..
        }) => ErrorContext::new(error)
            .with_suggestion("Check the YAML syntax: indentation, quoting and list markers")
            .with_details("The descriptor could not be parsed as a YAML mapping"),
        TemplateError::InvalidDescriptor {
            ..
        } => ErrorContext::new(error)
            .with_suggestion("Fix the listed fields; warnings alone do not invalidate a descriptor"),
        TemplateError::Resolution(resolution) => {
            let suggestion = match resolution {
                ResolutionError::Unclassifiable {
                    ..
                }
                | ResolutionError::NoResolver {
                    ..
                } => Some(
                    "Use a local path (./dir), a repository reference (owner/repo[@ref][/path]) or an https:// URL",
                ),
                ResolutionError::SecurityViolation {
                    ..
                } => Some("Review the [security] section of the tplkit configuration"),
                ResolutionError::PayloadTooLarge {
                    ..
                } => Some("Raise security.max_download_size if the template is trusted"),
                ResolutionError::Timeout {
                    ..
                } => Some("Check your network connection or raise security.request_timeout_secs"),
                ResolutionError::HttpStatus {
                    status: 404,
                    ..
                }
                | ResolutionError::NotFound {
                    ..
                } => Some("Verify the reference: path, repository name, ref and subpath"),
                _ => None,
            };
            let context = ErrorContext::new(error.clone());
            match suggestion {
                Some(s) => context.with_suggestion(s),
                None => context,
            }
        }
        TemplateError::Composition(CompositionError::Conflict {
            ..
        }) => ErrorContext::new(error)
            .with_suggestion("Use the merge, extend or replace strategy on the include to resolve collisions automatically"),
        TemplateError::Composition(CompositionError::CircularComposition {
            ..
        }) => ErrorContext::new(error)
            .with_suggestion("Remove one of the extends/includes links that form the cycle"),
        _ => ErrorContext::new(error),
    }
}
