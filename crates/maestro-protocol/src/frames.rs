use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Schema identifier carried by every frame.
pub const SCHEMA: &str = "public_sse_v1";

/// Frame kind discriminator. Clients parse by `kind`; there are no SSE
/// event names on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    RawResponse,
    RunItem,
    AgentUpdate,
    Lifecycle,
    GuardrailResult,
    Final,
    Error,
}

impl FrameKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FrameKind::Final | FrameKind::Error)
    }
}

/// Workflow tagging attached to every frame of a workflow stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WorkflowMeta {
    pub workflow_key: String,
    pub workflow_run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_index: Option<u32>,
}

/// An attachment resolved against the object store, shipped on frames and
/// persisted alongside messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageAttachment {
    pub object_id: String,
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_file_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presigned_url: Option<String>,
}

/// A tool invocation surfaced on `run_item` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ToolCallPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

/// Result of one guardrail check, surfaced on `guardrail_result` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailOutcome {
    pub guardrail_key: String,
    pub guardrail_stage: String,
    pub guardrail_tripwire_triggered: bool,
    pub guardrail_suppressed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guardrail_token_usage: Option<u64>,
    #[serde(skip_serializing_if = "Value::is_null", default)]
    pub info: Value,
}

/// One `public_sse_v1` frame.
///
/// The envelope fields are always present; kind-specific payload fields are
/// optional and omitted from the wire when unset. Wire lines are exactly
/// `data: <json>\n\n`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamFrame {
    pub schema: String,
    pub kind: FrameKind,
    pub event_id: u64,
    pub stream_id: String,
    pub server_timestamp: String,
    pub conversation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow: Option<WorkflowMeta>,

    // raw_response
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_delta: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_delta: Option<String>,

    // run_item / final
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_item_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_item_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCallPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<MessageAttachment>>,

    // agent_update
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    // lifecycle
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    // guardrail_result
    #[serde(flatten)]
    pub guardrail: Option<GuardrailOutcome>,

    // error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Envelope shared by every frame of one physical stream.
#[derive(Debug, Clone)]
pub struct FrameEnvelope {
    pub stream_id: String,
    pub conversation_id: String,
    pub agent: Option<String>,
    pub workflow: Option<WorkflowMeta>,
}

impl FrameEnvelope {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            stream_id: new_stream_id(),
            conversation_id: conversation_id.into(),
            agent: None,
            workflow: None,
        }
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_workflow(mut self, workflow: WorkflowMeta) -> Self {
        self.workflow = Some(workflow);
        self
    }

    fn base(&self, kind: FrameKind, event_id: u64) -> StreamFrame {
        StreamFrame {
            schema: SCHEMA.to_string(),
            kind,
            event_id,
            stream_id: self.stream_id.clone(),
            server_timestamp: now_rfc3339_millis(),
            conversation_id: self.conversation_id.clone(),
            response_id: None,
            agent: self.agent.clone(),
            workflow: self.workflow.clone(),
            raw_type: None,
            text_delta: None,
            reasoning_delta: None,
            run_item_type: None,
            run_item_name: None,
            response_text: None,
            structured_output: None,
            tool_call: None,
            tool_call_id: None,
            tool_name: None,
            annotations: None,
            attachments: None,
            new_agent: None,
            display_name: None,
            event: None,
            payload: None,
            guardrail: None,
            error_code: None,
            error_message: None,
        }
    }

    pub fn lifecycle(&self, event_id: u64, event: impl Into<String>, payload: Value) -> StreamFrame {
        let mut f = self.base(FrameKind::Lifecycle, event_id);
        f.event = Some(event.into());
        if !payload.is_null() {
            f.payload = Some(payload);
        }
        f
    }

    pub fn raw_response(
        &self,
        event_id: u64,
        raw_type: impl Into<String>,
        text_delta: Option<String>,
        reasoning_delta: Option<String>,
        response_id: Option<String>,
    ) -> StreamFrame {
        let mut f = self.base(FrameKind::RawResponse, event_id);
        f.raw_type = Some(raw_type.into());
        f.text_delta = text_delta;
        f.reasoning_delta = reasoning_delta;
        f.response_id = response_id;
        f
    }

    pub fn agent_update(
        &self,
        event_id: u64,
        new_agent: impl Into<String>,
        display_name: Option<String>,
    ) -> StreamFrame {
        let mut f = self.base(FrameKind::AgentUpdate, event_id);
        f.new_agent = Some(new_agent.into());
        f.display_name = display_name;
        f
    }

    pub fn run_item(&self, event_id: u64) -> StreamFrame {
        self.base(FrameKind::RunItem, event_id)
    }

    pub fn guardrail_result(&self, event_id: u64, outcome: GuardrailOutcome) -> StreamFrame {
        let mut f = self.base(FrameKind::GuardrailResult, event_id);
        f.guardrail = Some(outcome);
        f
    }

    pub fn final_frame(
        &self,
        event_id: u64,
        response_text: Option<String>,
        structured_output: Option<Value>,
        response_id: Option<String>,
    ) -> StreamFrame {
        let mut f = self.base(FrameKind::Final, event_id);
        f.response_text = response_text;
        f.structured_output = structured_output;
        f.response_id = response_id;
        f
    }

    pub fn error_frame(
        &self,
        event_id: u64,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> StreamFrame {
        let mut f = self.base(FrameKind::Error, event_id);
        f.error_code = Some(code.into());
        f.error_message = Some(message.into());
        f
    }
}

/// Fresh id for one physical stream delivery: `stream_<16hex>`.
pub fn new_stream_id() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    let suffix: String = (0..16)
        .map(|_| {
            let n: u8 = rng.random_range(0..16);
            char::from_digit(n as u32, 16).unwrap_or('0')
        })
        .collect();
    format!("stream_{suffix}")
}

/// RFC3339 UTC with millisecond precision, e.g. `2025-01-01T00:00:00.000Z`.
pub fn now_rfc3339_millis() -> String {
    chrono::Utc::now()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
