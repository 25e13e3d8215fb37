pub mod attachments;
pub mod engine;
pub mod error;
pub mod processor;
pub mod recorder;

pub use engine::{ChatOutcome, ChatRequest, ExecutionEngine};
pub use error::{EngineError, Result};
