//! tplkit - template configuration resolution
//!
//! Loads declarative template descriptors (`template.yaml`), composes them
//! through single inheritance (`extends`) and ordered, conditional inclusion
//! (`includes`), resolves their external dependencies, and fetches remote
//! template content with integrity checks, security policy enforcement and
//! an on-disk cache.
//!
//! # Architecture Overview
//!
//! ```text
//! path ─► descriptor::DescriptorParser
//!           │
//!           ▼
//!         compose::CompositionEngine ──► source::SourceManager ──► resolvers
//!           │                                   │                (local, repository,
//!           │                                   ▼                 http, registry)
//!           │                             cache::ResolutionCache
//!           ▼
//!         resolver::DependencyResolver ─► composed template + dependency graph
//! ```
//!
//! # Core Modules
//!
//! - [`descriptor`] - descriptor model, parsing, validation, step graphs and
//!   the restricted condition language
//! - [`compose`] - `extends`/`includes` composition and conflict strategies
//! - [`resolver`] - dependency normalization and resolution
//! - [`source`] - reference classification, resolvers and the
//!   [`SourceManager`](source::SourceManager)
//! - [`cache`] - checksum-verified resolution cache with TTL and size limits
//!
//! ## Supporting Modules
//! - [`config`] - global configuration (`~/.tplkit/config.toml`)
//! - [`core`] - error taxonomy and user-facing error formatting
//! - [`utils`] - checksums, directory sizes and URL policy checks
//! - [`constants`] - shared defaults
//!
//! # Descriptor Format
//!
//! ```yaml
//! name: web-service
//! version: 1.0.0
//! extends: ../base
//! variables:
//!   port:
//!     type: number
//!     default: 8080
//! includes:
//!   - url: acme/templates/docker
//!     variables:
//!       image: node:20
//!   - url: ./lint
//!     condition: "includeLint == true"
//! dependencies:
//!   - express@^4.18.0
//!   - name: shared
//!     type: local
//!     url: ../shared
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use tplkit::compose::{CompositionContext, CompositionEngine};
//! use tplkit::config::Config;
//! use tplkit::descriptor::DescriptorParser;
//! use tplkit::resolver::{DependencyResolver, ResolveOptions};
//! use tplkit::source::SourceManager;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::load().await?;
//! let manager = SourceManager::from_config(&config)?;
//! let engine = CompositionEngine::new(manager.clone());
//!
//! let root = std::env::current_dir()?;
//! let location = root.join("template.yaml");
//! let parsed = DescriptorParser::new().parse_file(&location).await?;
//! let ctx = CompositionContext::from_config(&root, &config.composition);
//! let composed = engine.compose_at(&parsed.descriptor, &location, &ctx).await?;
//!
//! let graph = DependencyResolver::new(manager)
//!     .resolve(&composed.descriptor.dependencies, &ResolveOptions::new(&root))
//!     .await;
//! println!("{} dependencies resolved", graph.resolved.len());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod compose;
pub mod config;
pub mod constants;
pub mod core;
pub mod descriptor;
pub mod resolver;
pub mod source;
pub mod utils;

// test_utils module is available for both unit tests and integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
