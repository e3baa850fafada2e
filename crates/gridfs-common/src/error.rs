//! Error types for GridFS
//!
//! This module defines the common error types used by the metadata store,
//! the metadata manager and the namespace facade.

use std::io;
use thiserror::Error;

/// Common result type for GridFS operations
pub type Result<T> = std::result::Result<T, Error>;

/// Markers that identify a protocol or version mismatch with the secondary
/// file system rather than an ordinary I/O failure.
const VERSION_MISMATCH_MARKERS: &[&str] = &["Failed on local", "RemoteException"];

/// Common error type for GridFS
#[derive(Debug, Error)]
pub enum Error {
    // Namespace errors
    #[error("path not found: {0}")]
    NotFound(String),

    #[error("path already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("parent is not a directory: {0}")]
    ParentNotDirectory(String),

    #[error("directory is not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("file is locked by another writer: {0}")]
    FileLocked(String),

    #[error("operation is not supported in PROXY mode: {0}")]
    ProxyMode(String),

    // Concurrency errors
    #[error("concurrent modification detected")]
    ConcurrentModification,

    #[error("transaction lock timed out: {0}")]
    TxTimeout(String),

    // Secondary file system errors
    #[error("{}: {message}", secondary_label(.version_mismatch))]
    SecondaryFs {
        message: String,
        version_mismatch: bool,
        #[source]
        source: Option<io::Error>,
    },

    // Storage errors
    #[error("storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    // Internal errors
    #[error("inconsistent metadata: {0}")]
    Inconsistent(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a not found error
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create an already exists error
    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists(path.into())
    }

    /// Create an invalid path error
    pub fn invalid_path(msg: impl Into<String>) -> Self {
        Self::InvalidPath(msg.into())
    }

    /// Create an inconsistent state error
    pub fn inconsistent(msg: impl Into<String>) -> Self {
        Self::Inconsistent(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Wrap an I/O failure reported by the secondary file system.
    pub fn secondary(msg: impl Into<String>, err: io::Error) -> Self {
        let version_mismatch = looks_like_version_mismatch(&err);

        Self::SecondaryFs {
            message: msg.into(),
            version_mismatch,
            source: Some(err),
        }
    }

    /// Secondary file system failure without an underlying I/O error.
    pub fn secondary_msg(msg: impl Into<String>) -> Self {
        Self::SecondaryFs {
            message: msg.into(),
            version_mismatch: false,
            source: None,
        }
    }

    /// Check if this is a retryable error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentModification | Self::TxTimeout(_))
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this error was raised by the secondary file system
    #[must_use]
    pub const fn is_secondary(&self) -> bool {
        matches!(self, Self::SecondaryFs { .. })
    }

    /// Check if this is a secondary file system version mismatch
    #[must_use]
    pub const fn is_version_mismatch(&self) -> bool {
        matches!(
            self,
            Self::SecondaryFs {
                version_mismatch: true,
                ..
            }
        )
    }
}

const fn secondary_label(version_mismatch: &bool) -> &'static str {
    if *version_mismatch {
        "secondary file system version mismatch"
    } else {
        "secondary file system error"
    }
}

fn looks_like_version_mismatch(err: &io::Error) -> bool {
    let msg = err.to_string();

    VERSION_MISMATCH_MARKERS.iter().any(|m| msg.contains(m))
}
