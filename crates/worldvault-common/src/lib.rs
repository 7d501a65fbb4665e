//! WorldVault Common - Shared types and utilities
//!
//! This crate provides the identifiers, lease record, error taxonomy and
//! configuration used across all WorldVault components.

pub mod config;
pub mod error;
pub mod types;

pub use config::{CompressionAlgorithm, Config};
pub use error::{Error, ErrorClass, Result};
pub use types::*;
