//! Core types for tplkit
//!
//! This module holds the error taxonomy shared by every stage of the
//! resolution pipeline. See [`error`] for the categories and for
//! [`user_friendly_error`], which the driver binary uses to render failures.

pub mod error;

pub use error::{
    CompositionError, ErrorContext, ResolutionError, TemplateConfigError, TemplateError,
    user_friendly_error,
};
