//! GridFS Common - Shared types and utilities
//!
//! This crate provides the entry model, namespace paths, error definitions
//! and configuration used across all GridFS components.

pub mod config;
pub mod error;
pub mod path;
pub mod types;

pub use config::FsConfig;
pub use error::{Error, Result};
pub use path::FsPath;
pub use types::*;
