//! Error types of the cache layer.

use crate::remote::RemoteError;
use std::io;
use std::path::{Path, PathBuf};

pub type IoPathResult<T> = Result<T, IoPathError>;

/// A local I/O error together with the path it occurred on.
#[derive(Debug)]
pub struct IoPathError {
    error: io::Error,
    path: PathBuf,
}

impl std::fmt::Display for IoPathError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "I/O error on path {}: {}", self.path.display(), self.error)
    }
}

impl std::error::Error for IoPathError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl IoPathError {
    pub fn new(error: io::Error, path: impl Into<PathBuf>) -> Self {
        Self {
            error,
            path: path.into(),
        }
    }

    pub fn io_error(&self) -> &io::Error {
        &self.error
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub trait WithPath<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> IoPathResult<T>;
}

impl<T> WithPath<T> for io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> IoPathResult<T> {
        self.map_err(|e| IoPathError::new(e, path))
    }
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Errors surfaced to callers of the cache engines.
///
/// Corrupt local entries never show up here; they are handled as cache misses.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CacheError {
    /// The object or table does not exist remotely. Any local copy has been invalidated.
    #[error("{resource} does not exist remotely")]
    NotFound { resource: String },

    /// The remote service failed. Existing local entries are left untouched.
    #[error("remote service unavailable while accessing {resource}")]
    RemoteUnavailable {
        resource: String,
        #[source]
        source: RemoteError,
    },

    /// The remote service rejected the request as invalid.
    #[error("request on {resource} was rejected")]
    Rejected {
        resource: String,
        #[source]
        source: RemoteError,
    },

    /// The operation was cancelled before it completed. Nothing was committed.
    #[error("operation on {resource} was cancelled")]
    Cancelled { resource: String },

    /// Reading or writing the local cache failed.
    #[error(transparent)]
    Io(#[from] IoPathError),

    /// A payload could not be (de)serialized.
    #[error("could not (de)serialize {resource}")]
    Serialization {
        resource: String,
        #[source]
        source: serde_json::Error,
    },

    /// A payload read as text is not valid UTF-8.
    #[error("{resource} is not valid UTF-8")]
    InvalidUtf8 {
        resource: String,
        #[source]
        source: std::string::FromUtf8Error,
    },

    /// A table item lacks a usable primary key.
    #[error("invalid item in table {table}: {reason}")]
    InvalidItem { table: String, reason: String },
}

impl CacheError {
    /// Classifies an error reported by a remote collaborator.
    pub fn from_remote(resource: impl Into<String>, error: RemoteError) -> Self {
        let resource = resource.into();
        match error {
            RemoteError::NotFound => Self::NotFound { resource },
            RemoteError::Cancelled => Self::Cancelled { resource },
            source @ RemoteError::Unavailable(_) => Self::RemoteUnavailable { resource, source },
            source @ RemoteError::Rejected(_) => Self::Rejected { resource, source },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_remote_unavailable(&self) -> bool {
        matches!(self, Self::RemoteUnavailable { .. })
    }
}
