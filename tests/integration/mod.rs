//! Integration test suite for tplkit
//!
//! End-to-end tests of parsing, composition, source resolution, caching and
//! dependency resolution. Remote sources are served by `wiremock`.
//!
//! ```bash
//! cargo test --test integration
//! ```
//!
//! - **cli**: the `tplkit` binary
//! - **composition**: `extends`/`includes` and conflict strategies
//! - **dependencies**: dependency normalization and resolution
//! - **parsing**: descriptor determinism and step cycles
//! - **resolution**: cache hits, integrity and payload limits

#[path = "../common/mod.rs"]
mod common;

mod cli;
mod composition;
mod dependencies;
mod parsing;
mod resolution;
