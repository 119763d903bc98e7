//! Configuration management for tplkit
//!
//! The resolution core consumes configuration but never owns it: a caller
//! loads a [`Config`] (TOML, see [`global`] for the format and location) and
//! passes the relevant sections into the components it builds.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (`TPLKIT_CONFIG_PATH`, `TPLKIT_CACHE_DIR`)
//! 2. The configuration file
//! 3. Default values
//!
//! # Security Configuration
//!
//! [`SecurityConfig`] carries the transport and domain policy that the
//! [`crate::source::SourceManager`] and remote resolvers enforce:
//! secure transport, allow/block lists, the maximum payload size and the
//! per-request timeout.

pub mod global;

pub use global::{
    CacheConfig, CompositionConfig, Config, RegistryConfig, RepositoryConfig, SecurityConfig,
    get_cache_dir,
};
