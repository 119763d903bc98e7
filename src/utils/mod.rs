//! Cross-cutting utilities
//!
//! - [`fs`] - checksums, directory sizes and atomic writes
//! - [`security`] - local path blacklist and remote URL policy

pub mod fs;
pub mod security;

pub use fs::{atomic_write, checksum, dir_size, hash_key};
pub use security::{validate_path_security, validate_url_policy};
