use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageMode {
    Sequential,
    Parallel,
}

/// One agent invocation within a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    #[serde(default)]
    pub name: Option<String>,
    pub agent_key: String,
    /// Registered guard callable; false skips the step and the input
    /// passes through.
    #[serde(default)]
    pub guard: Option<String>,
    /// Registered mapper callable deriving this step's input.
    #[serde(default)]
    pub input_mapper: Option<String>,
    #[serde(default)]
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub output_schema: Option<Value>,
}

impl StepSpec {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.agent_key)
    }
}

/// A group of steps executed sequentially or in parallel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    pub mode: StageMode,
    /// Registered reducer combining parallel branch outputs.
    #[serde(default)]
    pub reducer: Option<String>,
    pub steps: Vec<StepSpec>,
}

/// A declared workflow: stages of steps, each step one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub key: String,
    pub display_name: String,
    pub description: String,
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub allow_handoff_agents: bool,
    pub stages: Vec<StageSpec>,
    #[serde(default)]
    pub output_schema: Option<Value>,
}

impl WorkflowSpec {
    pub fn descriptor(&self) -> WorkflowDescriptor {
        WorkflowDescriptor {
            key: self.key.clone(),
            display_name: self.display_name.clone(),
            description: self.description.clone(),
            default: self.default,
            stage_count: self.stages.len(),
            step_count: self.stages.iter().map(|s| s.steps.len()).sum(),
        }
    }
}

/// Catalog entry returned by the workflows listing.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowDescriptor {
    pub key: String,
    pub display_name: String,
    pub description: String,
    pub default: bool,
    pub stage_count: usize,
    pub step_count: usize,
}
