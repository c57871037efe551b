//! Error types for SqlFs

use thiserror::Error;

/// Result type for SqlFs operations
pub type Result<T> = std::result::Result<T, FsError>;

/// Filesystem and storage error types
#[derive(Error, Debug)]
pub enum FsError {
    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Path already exists: {0}")]
    AlreadyExists(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Not a file: {0}")]
    NotAFile(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Corrupt chunk {chunk_no} of path id {path_id}: {reason}")]
    CorruptChunk {
        path_id: i64,
        chunk_no: i64,
        reason: String,
    },

    #[error("Size mismatch for {path}: expected {expected} bytes, reassembled {actual}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage failure: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FsError {
    pub fn not_found(path: impl Into<String>) -> Self {
        FsError::NotFound(path.into())
    }

    pub fn already_exists(path: impl Into<String>) -> Self {
        FsError::AlreadyExists(path.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound(_))
    }
}

impl From<FsError> for std::io::Error {
    fn from(err: FsError) -> Self {
        use std::io::ErrorKind;
        match err {
            FsError::Io(e) => e,
            FsError::NotFound(_) => std::io::Error::new(ErrorKind::NotFound, err),
            FsError::AlreadyExists(_) => std::io::Error::new(ErrorKind::AlreadyExists, err),
            FsError::CorruptChunk { .. } | FsError::SizeMismatch { .. } => {
                std::io::Error::new(ErrorKind::InvalidData, err)
            }
            other => std::io::Error::other(other),
        }
    }
}
