use maestro_core::error::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object not found: {key}")]
    NotFound { key: String },

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Storage configuration error: {0}")]
    Config(String),
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::NotFound { .. } => ErrorKind::NotFound,
            StorageError::Config(_) => ErrorKind::PaymentRequired,
            StorageError::Backend(_) | StorageError::Http(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
