// Error types for the file tracker
use crate::metadata::MetadataError;
use thiserror::Error;

/// File tracker operation errors.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("invalid hash {hash:?}: {reason}")]
    InvalidHash { hash: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid metadata: {0}")]
    InvalidMetadata(#[source] MetadataError),

    #[error("not found: {hash} shard {shard}")]
    NotFound { hash: String, shard: u32 },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to publish {path}: {source}")]
    Persist {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl TrackerError {
    /// Errors caused by what the caller passed in. These are never worth retrying.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            TrackerError::InvalidHash { .. }
                | TrackerError::InvalidConfig(_)
                | TrackerError::InvalidInput(_)
                | TrackerError::InvalidMetadata(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, TrackerError::NotFound { .. })
    }
}

/// Result type for tracker operations.
pub type TrackerResult<T> = std::result::Result<T, TrackerError>;
