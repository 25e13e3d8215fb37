use maestro_core::types::{ConversationId, TenantId, TenantRole, TenantStatus, UserId, UserStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct Tenant {
    pub id: TenantId,
    pub slug: String,
    pub name: String,
    pub status: TenantStatus,
    pub status_updated_at: String,
    pub status_reason: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub status: UserStatus,
    pub email_verified_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct Membership {
    pub user_id: UserId,
    pub tenant_id: TenantId,
    pub role: TenantRole,
}

#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub tenant_id: TenantId,
    pub conversation_key: String,
    pub agent_entrypoint: Option<String>,
    pub active_agent: Option<String>,
    pub status: String,
    pub message_count: u64,
    pub total_tokens_in: u64,
    pub total_tokens_out: u64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct Segment {
    pub id: String,
    pub conversation_id: ConversationId,
    pub segment_index: u32,
    pub parent_segment_id: Option<String>,
    pub visible_through_event_id: Option<u64>,
    pub visible_through_message_position: Option<u32>,
    pub truncated_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: ConversationId,
    pub segment_id: String,
    pub position: u32,
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Value>,
    pub created_at: String,
}

/// Input for one message append.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    pub attachments: Option<Value>,
}

/// One normalized run item projected into the audit log.
#[derive(Debug, Clone, Default)]
pub struct NewRunItem {
    pub response_id: Option<String>,
    pub run_item_type: String,
    pub run_item_name: Option<String>,
    pub role: Option<String>,
    pub agent: Option<String>,
    pub tool_call_id: Option<String>,
    pub tool_name: Option<String>,
    pub model: Option<String>,
    pub content_text: Option<String>,
    pub reasoning_text: Option<String>,
    pub call_arguments: Option<Value>,
    pub call_output: Option<Value>,
    pub attachments: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunItemRow {
    pub conversation_id: ConversationId,
    pub sequence_no: u64,
    pub response_id: String,
    pub run_item_type: String,
    pub run_item_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub tool_call_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_arguments: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Value>,
    pub created_at: String,
}

/// Session lifecycle state for one conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationSessionState {
    pub provider: Option<String>,
    pub provider_conversation_id: Option<String>,
    pub sdk_session_id: Option<String>,
    pub session_cursor: Option<String>,
    pub last_session_sync_at: Option<String>,
}

/// Detailed usage attribution for one provider response.
#[derive(Debug, Clone, Default)]
pub struct RunUsage {
    pub conversation_id: Option<ConversationId>,
    pub response_id: String,
    pub run_id: Option<String>,
    pub agent_key: Option<String>,
    pub provider: Option<String>,
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_input_tokens: u64,
    pub reasoning_output_tokens: u64,
}

/// Aggregated usage over one counter bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub requests: u64,
    pub storage_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowRunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl WorkflowRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowRunStatus::Running => "running",
            WorkflowRunStatus::Succeeded => "succeeded",
            WorkflowRunStatus::Failed => "failed",
            WorkflowRunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowRunStatus::Running)
    }
}

impl std::str::FromStr for WorkflowRunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(WorkflowRunStatus::Running),
            "succeeded" => Ok(WorkflowRunStatus::Succeeded),
            "failed" => Ok(WorkflowRunStatus::Failed),
            "cancelled" => Ok(WorkflowRunStatus::Cancelled),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowRun {
    pub id: String,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub workflow_key: String,
    pub status: WorkflowRunStatus,
    pub conversation_id: ConversationId,
    pub request_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_output_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_output_structured: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowStepRow {
    pub run_id: String,
    pub sequence_no: u32,
    pub step_name: String,
    pub agent_key: String,
    pub stage_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    pub status: String,
}

/// One recorded public SSE frame reference (payload may be spilled).
#[derive(Debug, Clone)]
pub struct LedgerEventRef {
    pub conversation_id: ConversationId,
    pub event_id: u64,
    pub stream_id: String,
    pub workflow_run_id: Option<String>,
    pub kind: String,
    pub payload_inline_json: Option<String>,
    pub payload_object_key: Option<String>,
    pub payload_size_bytes: u64,
    pub payload_sha256: Option<String>,
    pub created_at: String,
}

/// Input for one ledger append (event id assigned by the writer).
#[derive(Debug, Clone)]
pub struct NewLedgerEvent {
    pub tenant_id: TenantId,
    pub conversation_id: ConversationId,
    pub event_id: u64,
    pub stream_id: String,
    pub workflow_run_id: Option<String>,
    pub kind: String,
    pub payload_inline_json: Option<String>,
    pub payload_object_key: Option<String>,
    pub payload_size_bytes: u64,
    pub payload_sha256: Option<String>,
}
