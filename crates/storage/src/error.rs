//! Object store errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    /// No object under the key.
    #[error("no object at {0}")]
    NotFound(String),

    /// The key is empty, escapes the store root, or crosses a symlink.
    #[error("rejected object key: {0}")]
    InvalidKey(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;
