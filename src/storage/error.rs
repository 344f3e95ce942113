//! Storage layer error types
//!
//! All errors that can occur during a mutating journal operation are defined
//! here. We use `thiserror` for ergonomic error definition. Sync has its own
//! error type in the sync module since it covers a different failure domain
//! (remote configuration and network exchange).

use std::path::PathBuf;

use thiserror::Error;

use crate::storage::serializer::SerializationError;
use crate::storage::types::{TopicId, ValidationError};

/// the main error type for journal storage operations
///
/// every failed mutating operation leaves the repository at its last good
/// commit before one of these is returned
#[derive(Debug, Error)]
pub enum StorageError {
    /// error from the underlying Git library
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    /// I/O error (filesystem level)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// malformed id or name input
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// malformed persisted record
    #[error("serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// repository metadata file could not be read or written
    #[error("metadata error: {0}")]
    Metadata(#[from] serde_yaml::Error),

    /// the path exists but is not a journal repository
    #[error("not a journal repository: {0}")]
    NotAJournal(PathBuf),

    /// the requested topic does not exist
    #[error("topic not found: {0}")]
    TopicNotFound(TopicId),

    /// internal error that shouldn't happen
    #[error("internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// check if this error indicates the resource doesn't exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::TopicNotFound(_) | StorageError::NotAJournal(_)
        )
    }
}

/// result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
