use std::sync::Arc;

use async_trait::async_trait;
use maestro_core::error::ErrorKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Pipeline stage a guardrail runs at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailStage {
    PreFlight,
    Input,
    Output,
    ToolInput,
    ToolOutput,
}

impl GuardrailStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardrailStage::PreFlight => "pre_flight",
            GuardrailStage::Input => "input",
            GuardrailStage::Output => "output",
            GuardrailStage::ToolInput => "tool_input",
            GuardrailStage::ToolOutput => "tool_output",
        }
    }

    /// Blocking stages stop the run on the first non-suppressed tripwire;
    /// output stages run everything and redact instead.
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            GuardrailStage::PreFlight | GuardrailStage::Input | GuardrailStage::ToolInput
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardrailEngine {
    Regex,
    Llm,
    Api,
    Hybrid,
}

/// Result of one check invocation.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GuardrailCheckResult {
    pub tripwire_triggered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub info: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<u64>,
}

impl GuardrailCheckResult {
    /// Matched spans a redaction pass should replace, if the check
    /// reported any.
    pub fn matches(&self) -> Vec<String> {
        self.info
            .get("matches")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A check implementation registered at startup. Specs stay data; the
/// key-to-function table is fixed when the registry is built.
#[async_trait]
pub trait GuardrailCheck: Send + Sync {
    /// Validate a merged config. Failures are fatal at resolve time.
    fn validate_config(&self, config: &Value) -> Result<(), GuardrailError>;

    async fn check(&self, content: &str, config: &Value)
        -> Result<GuardrailCheckResult, GuardrailError>;
}

#[derive(Clone)]
pub struct GuardrailSpec {
    pub key: String,
    pub display_name: String,
    pub description: String,
    pub stage: GuardrailStage,
    pub engine: GuardrailEngine,
    pub default_config: Value,
    pub check: Arc<dyn GuardrailCheck>,
}

#[derive(Debug, Error)]
pub enum GuardrailError {
    #[error("Guardrail '{key}' not found in registry")]
    UnknownGuardrail { key: String },

    #[error("Guardrail preset '{key}' not found")]
    UnknownPreset { key: String },

    #[error("Invalid config for guardrail '{key}': {reason}")]
    InvalidConfig { key: String, reason: String },

    #[error("Guardrail check failed: {0}")]
    CheckFailed(String),
}

impl GuardrailError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GuardrailError::UnknownGuardrail { .. } | GuardrailError::UnknownPreset { .. } => {
                ErrorKind::Validation
            }
            GuardrailError::InvalidConfig { .. } => ErrorKind::Validation,
            GuardrailError::CheckFailed(_) => ErrorKind::Internal,
        }
    }
}
