use maestro_core::error::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Workflow '{key}' not found")]
    UnknownWorkflow { key: String },

    #[error("Workflow run not found: {id}")]
    UnknownRun { id: String },

    #[error("Workflow validation error: {0}")]
    Validation(String),

    #[error("Engine error: {0}")]
    Engine(#[from] maestro_engine::EngineError),

    #[error("Store error: {0}")]
    Store(#[from] maestro_store::StoreError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] maestro_ledger::LedgerError),
}

impl WorkflowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkflowError::UnknownWorkflow { .. } | WorkflowError::UnknownRun { .. } => {
                ErrorKind::NotFound
            }
            WorkflowError::Validation(_) => ErrorKind::Validation,
            WorkflowError::Engine(e) => e.kind(),
            WorkflowError::Store(e) => e.kind(),
            WorkflowError::Ledger(e) => e.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkflowError>;
