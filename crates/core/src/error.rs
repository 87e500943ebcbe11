//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid environment identifier: {0}")]
    InvalidEnvironmentId(String),

    #[error("invalid carve status: {0}")]
    InvalidCarveStatus(String),

    #[error("invalid carve request: {0}")]
    InvalidCarve(String),

    #[error("invalid query type: {0}")]
    InvalidQueryType(String),

    #[error("invalid node query status: {0}")]
    InvalidNodeQueryStatus(String),

    #[error("invalid log type: {0}")]
    InvalidLogType(String),

    #[error("invalid node key secret: {0}")]
    InvalidNodeKeySecret(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
