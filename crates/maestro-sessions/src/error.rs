use maestro_core::error::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Store error: {0}")]
    Store(#[from] maestro_store::StoreError),

    #[error("Provider error: {0}")]
    Provider(#[from] maestro_providers::ProviderError),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Store(e) => e.kind(),
            SessionError::Provider(e) => e.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
