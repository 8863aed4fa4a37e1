//! Error kinds for the facade and every component beneath it. Errors
//! bubble up unchanged; no component silently retries except the mirror
//! synchronizer, which may repair a transient mismatch by copying.

use storage_engine::EngineError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VfsError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("page size mismatch: image declares {on_disk}, requested {requested}")]
    PageSizeMismatch { on_disk: i32, requested: i32 },

    #[error("corruption detected: {0}")]
    Corruption(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("operation on disposed {0}")]
    Disposed(&'static str),

    #[error("superblock payload of {len} bytes exceeds capacity of {capacity} bytes")]
    CommitOverflow { len: usize, capacity: usize },
}

pub type VfsResult<T> = Result<T, VfsError>;

impl From<EngineError> for VfsError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Io(io_err) => VfsError::Io(io_err.to_string()),
            EngineError::PageSizeMismatch { on_disk, requested } => {
                VfsError::PageSizeMismatch { on_disk, requested }
            }
            EngineError::CommitOverflow { len, capacity } => {
                VfsError::CommitOverflow { len, capacity }
            }
            EngineError::Corruption => VfsError::Corruption("superblock".to_string()),
        }
    }
}

impl From<std::io::Error> for VfsError {
    fn from(e: std::io::Error) -> Self {
        VfsError::Io(e.to_string())
    }
}
