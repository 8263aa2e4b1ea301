//! Loader error kinds.

use std::io;

use thiserror::Error;
use vmsnap_cas::CasError;
use vmsnap_cow::CowError;
use vmsnap_manifest::ManifestError;

use crate::context::AuthError;

/// Errors returned by loader operations.
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal: {0}")]
    Internal(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// A lower-level failure annotated with the operation and artifact.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<SnapshotError>,
    },

    #[error("cache error: {0}")]
    Cache(#[from] CasError),

    #[error("chunk error: {0}")]
    Cow(#[from] CowError),

    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("group resolution failed: {0}")]
    Auth(#[from] AuthError),
}

/// Coarse classification of a [`SnapshotError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    Unavailable,
    Internal,
    Cancelled,
    DeadlineExceeded,
    Unauthenticated,
}

impl SnapshotError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        SnapshotError::Io {
            context: context.into(),
            source,
        }
    }

    /// Wrap `self` with the operation that failed.
    pub fn context(self, context: impl Into<String>) -> Self {
        SnapshotError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SnapshotError::Context { source, .. } => source.kind(),
            SnapshotError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            SnapshotError::NotFound(_) => ErrorKind::NotFound,
            SnapshotError::Unavailable(_) => ErrorKind::Unavailable,
            SnapshotError::Cancelled => ErrorKind::Cancelled,
            SnapshotError::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            SnapshotError::Auth(_) => ErrorKind::Unauthenticated,
            SnapshotError::Cache(CasError::NotFound { .. }) => ErrorKind::NotFound,
            SnapshotError::Io { source, .. } if source.kind() == io::ErrorKind::NotFound => {
                ErrorKind::NotFound
            }
            SnapshotError::Cow(CowError::MissingBacking { .. }) => ErrorKind::NotFound,
            SnapshotError::Manifest(ManifestError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                ErrorKind::NotFound
            }
            _ => ErrorKind::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_unavailable(&self) -> bool {
        self.kind() == ErrorKind::Unavailable
    }
}

pub type Result<T> = std::result::Result<T, SnapshotError>;
