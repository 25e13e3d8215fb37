use maestro_core::error::ErrorKind;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Store error: {0}")]
    Store(#[from] maestro_store::StoreError),

    #[error("Storage error: {0}")]
    Storage(#[from] maestro_storage::StorageError),

    #[error("Session error: {0}")]
    Session(#[from] maestro_sessions::SessionError),

    #[error("Provider error: {0}")]
    Provider(#[from] maestro_providers::ProviderError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] maestro_ledger::LedgerError),

    #[error("Guardrail '{key}' tripwire triggered at {stage}")]
    Guardrail {
        key: String,
        stage: String,
        info: Value,
    },

    #[error("Guardrail configuration error: {0}")]
    GuardrailConfig(#[from] maestro_guardrails::GuardrailError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Store(e) => e.kind(),
            EngineError::Storage(e) => e.kind(),
            EngineError::Session(e) => e.kind(),
            EngineError::Provider(e) => e.kind(),
            EngineError::Ledger(e) => e.kind(),
            EngineError::Guardrail { .. } => ErrorKind::GuardrailTriggered,
            EngineError::GuardrailConfig(e) => e.kind(),
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn code(&self) -> &'static str {
        self.kind().code()
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
