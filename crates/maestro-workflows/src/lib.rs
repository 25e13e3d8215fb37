pub mod callables;
pub mod error;
pub mod registry;
pub mod runner;
pub mod spec;

pub use error::{Result, WorkflowError};
pub use registry::WorkflowRegistry;
pub use runner::{WorkflowRunOutcome, WorkflowRunRequest, WorkflowService};
pub use spec::{StageMode, StageSpec, StepSpec, WorkflowDescriptor, WorkflowSpec};
