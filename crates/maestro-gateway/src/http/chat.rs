//! Chat endpoints — POST /api/v1/chat and /api/v1/chat/stream.
//!
//! Both run the same engine pipeline; the streaming variant delivers
//! `public_sse_v1` frames as they are recorded to the ledger.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use maestro_core::types::TenantRole;
use maestro_engine::attachments::InputAttachment;
use maestro_engine::ChatRequest;
use maestro_providers::{MemoryStrategyConfig, TokenUsage};
use maestro_tenancy::usage_policy::UsageDecision;

use crate::app::AppState;
use crate::auth::gate;
use crate::error::{ApiError, ApiResult};
use crate::http::sse;

#[derive(Deserialize)]
pub struct ChatBody {
    pub message: String,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub attachments: Vec<InputAttachment>,
    #[serde(default)]
    pub memory_strategy: Option<MemoryStrategyConfig>,
    #[serde(default)]
    pub run_options: Option<Value>,
    #[serde(default)]
    pub location: Option<Value>,
    #[serde(default)]
    pub share_location: Option<bool>,
}

#[derive(Serialize)]
pub struct ChatReply {
    pub response: String,
    pub conversation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    pub agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_output: Option<Value>,
    pub usage: TokenUsage,
    /// Present when a soft plan limit was reached during this request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_warning: Option<UsageDecision>,
}

fn build_request(
    body: ChatBody,
    actor: maestro_core::types::ActorContext,
) -> ApiResult<ChatRequest> {
    if body.message.trim().is_empty() {
        return Err(ApiError::validation("message cannot be empty"));
    }
    let mut req = ChatRequest::new(actor, body.message);
    req.agent_key = body.agent_type;
    req.conversation_key = body.conversation_id;
    req.attachments = body.attachments;
    req.memory_strategy = body.memory_strategy;
    if body.share_location.unwrap_or(false) {
        req.location_hint = body.location;
    }
    let _ = body.run_options; // accepted for compatibility; no options yet
    Ok(req)
}

/// POST /api/v1/chat — non-streaming chat turn. Min role: member.
pub async fn chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ChatBody>,
) -> ApiResult<Json<ChatReply>> {
    let outcome = gate(
        &state.gate,
        &headers,
        TenantRole::Member,
        &["conversations:write"],
        true,
    )?;
    let req = build_request(body, outcome.actor)?;

    let result = state.engine.run(req).await?;
    Ok(Json(ChatReply {
        response: result.response_text,
        conversation_id: result.conversation_id.to_string(),
        response_id: result.response_id,
        agent: result.agent,
        structured_output: result.structured_output,
        usage: result.usage,
        usage_warning: match outcome.usage {
            UsageDecision::Allow => None,
            soft => Some(soft),
        },
    }))
}

/// POST /api/v1/chat/stream — SSE chat turn. Min role: member.
pub async fn chat_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ChatBody>,
) -> ApiResult<impl IntoResponse> {
    let outcome = gate(
        &state.gate,
        &headers,
        TenantRole::Member,
        &["conversations:write"],
        true,
    )?;
    // resolve the agent before the stream starts so bad keys get a 404
    state
        .providers
        .resolve(body.agent_type.as_deref())
        .map_err(maestro_engine::EngineError::from)?;
    let mut req = build_request(body, outcome.actor)?;

    let cancel = CancellationToken::new();
    req.cancel = cancel.clone();

    let (tx, rx) = mpsc::channel(256);
    let engine = Arc::clone(&state.engine);
    tokio::spawn(async move {
        if let Err(e) = engine.run_stream(req, tx).await {
            // already surfaced to the client as the terminal error frame
            warn!(error = %e, "streaming chat turn failed");
        }
    });

    Ok(sse::frame_response(
        rx,
        cancel,
        state.config.stream.heartbeat_interval_s,
    ))
}
