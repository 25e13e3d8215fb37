use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Token accounting for one provider response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_input_tokens: u64,
    pub reasoning_output_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.requests += other.requests;
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cached_input_tokens += other.cached_input_tokens;
        self.reasoning_output_tokens += other.reasoning_output_tokens;
    }
}

/// A completed run item: one normalized unit of provider output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunItem {
    /// message | tool_call | tool_output | reasoning | image_generation
    pub item_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_arguments: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_text: Option<String>,
    /// Base64 image data for image_generation items.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_base64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_mime: Option<String>,
}

/// Events emitted while a provider streams a response. The engine
/// normalizes these into public frames; providers never see the envelope.
#[derive(Debug, Clone)]
pub enum AgentStreamEvent {
    /// Incremental text or reasoning content with the raw provider event
    /// type attached. Never terminal on its own.
    RawDelta {
        raw_type: String,
        text_delta: Option<String>,
        reasoning_delta: Option<String>,
        response_id: Option<String>,
    },

    /// A completed run item.
    RunItem(Box<RunItem>),

    /// The run handed off to a different agent.
    AgentUpdate {
        new_agent: String,
        display_name: Option<String>,
    },

    /// Provider-side lifecycle notice (tool_start, tool_end, ...).
    Lifecycle { event: String, payload: Value },

    /// Stream completed successfully.
    Final {
        response_id: Option<String>,
        response_text: Option<String>,
        structured_output: Option<Value>,
        usage: TokenUsage,
    },

    /// Stream failed; the engine converts this into the terminal frame.
    Error { code: String, message: String },
}

impl AgentStreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentStreamEvent::Final { .. } | AgentStreamEvent::Error { .. })
    }
}
