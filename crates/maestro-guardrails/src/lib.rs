pub mod checks;
pub mod executor;
pub mod registry;
pub mod resolver;
pub mod spec;

pub use executor::{ExecutedGuardrail, GuardrailRuntime, StageOutcome};
pub use registry::GuardrailRegistry;
pub use resolver::{resolve_pipeline, ResolvedGuardrail, ResolvedPipeline};
pub use spec::{GuardrailCheck, GuardrailCheckResult, GuardrailError, GuardrailSpec, GuardrailStage};
