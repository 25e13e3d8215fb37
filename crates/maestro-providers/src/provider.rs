use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use maestro_core::error::ErrorKind;

use crate::event::{AgentStreamEvent, RunItem, TokenUsage};
use crate::session::{ConversationFactory, MemoryStrategyConfig, SessionHandle, SessionStore};

/// Static description of one agent the provider can run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub model: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Agents this one may hand off to. Workflows that disallow handoffs
    /// reject agents with a non-empty list.
    #[serde(default)]
    pub handoffs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_strategy_default: Option<MemoryStrategyConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

/// One agent turn handed to the provider runtime.
pub struct AgentRunRequest {
    pub agent: AgentDescriptor,
    pub message: String,
    /// Provider-native input items for resolved attachments.
    pub input_items: Vec<Value>,
    pub session: Arc<dyn SessionHandle>,
    pub provider_conversation_id: Option<String>,
    pub conversation_id: String,
    /// Opaque metadata (workflow context, runtime hints).
    pub metadata: Value,
}

/// Completed non-streaming run.
#[derive(Debug, Clone)]
pub struct AgentRunResponse {
    pub response_id: String,
    pub response_text: String,
    pub structured_output: Option<Value>,
    pub run_items: Vec<RunItem>,
    pub usage: TokenUsage,
    pub agent: String,
}

/// Capability set every model-provider runtime exposes.
#[async_trait]
pub trait AgentProvider: Send + Sync {
    /// Provider name for logging and usage attribution.
    fn name(&self) -> &str;

    /// Expected prefix of provider conversation ids. Ids that do not match
    /// are discarded by the session manager.
    fn conversation_id_prefix(&self) -> &str {
        "conv_"
    }

    /// Run one agent turn, waiting for the full response.
    async fn run(&self, req: AgentRunRequest) -> Result<AgentRunResponse, ProviderError>;

    /// Stream normalized events through a channel. The default falls back
    /// to `run` and emits one delta, the message item, and the terminal.
    async fn run_stream(
        &self,
        req: AgentRunRequest,
        tx: mpsc::Sender<AgentStreamEvent>,
    ) -> Result<(), ProviderError> {
        let agent = req.agent.key.clone();
        let resp = self.run(req).await?;
        let _ = tx
            .send(AgentStreamEvent::RawDelta {
                raw_type: "response.output_text.delta".to_string(),
                text_delta: Some(resp.response_text.clone()),
                reasoning_delta: None,
                response_id: Some(resp.response_id.clone()),
            })
            .await;
        let _ = tx
            .send(AgentStreamEvent::RunItem(Box::new(RunItem {
                item_type: "message".to_string(),
                role: Some("assistant".to_string()),
                response_id: Some(resp.response_id.clone()),
                response_text: Some(resp.response_text.clone()),
                name: Some(agent),
                ..Default::default()
            })))
            .await;
        let _ = tx
            .send(AgentStreamEvent::Final {
                response_id: Some(resp.response_id),
                response_text: Some(resp.response_text),
                structured_output: resp.structured_output,
                usage: resp.usage,
            })
            .await;
        Ok(())
    }

    /// Session container builder for this provider.
    fn session_store(&self) -> Arc<dyn SessionStore>;

    /// Conversation id factory. Providers without server-side
    /// conversations return `None`.
    fn conversation_factory(&self) -> Option<Arc<dyn ConversationFactory>> {
        None
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown agent: {key}")]
    UnknownAgent { key: String },

    #[error("operation cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::UnknownAgent { .. } => ErrorKind::NotFound,
            ProviderError::RateLimited { .. } => ErrorKind::RateLimited,
            ProviderError::Cancelled => ErrorKind::Cancelled,
            ProviderError::Http(_) | ProviderError::Unavailable(_) => ErrorKind::ProviderUnavailable,
            ProviderError::Api { .. } | ProviderError::Parse(_) => ErrorKind::ProviderUnavailable,
        }
    }
}
