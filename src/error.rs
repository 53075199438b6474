use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the object store collaborator.
///
/// The two variants are deliberately distinguishable: a missing object is an
/// expected condition (a project may simply lack an artifact), while a
/// transient failure marks the file or project as failed for this run.
#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object not found: {key}")]
    NotFound { key: String },
    #[error("object store request failed for {key}: {message}")]
    Transient { key: String, message: String },
}

impl ObjectStoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ObjectStoreError::NotFound { .. })
    }
}

/// Top-level error taxonomy.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] ObjectStoreError),

    /// The metadata artifact could not be decompressed or does not match the
    /// expected schema. The owning project is skipped, never the run.
    #[error("metadata artifact {} is corrupt: {reason}", path.display())]
    MetadataCorrupt { path: PathBuf, reason: String },

    /// Invalid flag or config combination. Fatal, reported before any work.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("I/O error at {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::MetadataCorrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
