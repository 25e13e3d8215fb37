use maestro_core::error::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Store error: {0}")]
    Store(#[from] maestro_store::StoreError),

    #[error("Storage error: {0}")]
    Storage(#[from] maestro_storage::StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid cursor")]
    InvalidCursor,

    #[error("Conversation not found")]
    ConversationNotFound,

    #[error("Ledger event {event_id} has no payload")]
    MissingPayload { event_id: u64 },
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::Store(e) => e.kind(),
            LedgerError::Storage(e) => e.kind(),
            LedgerError::InvalidCursor => ErrorKind::Validation,
            LedgerError::ConversationNotFound => ErrorKind::NotFound,
            LedgerError::Serialization(_) | LedgerError::Io(_) | LedgerError::MissingPayload { .. } => {
                ErrorKind::Internal
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
