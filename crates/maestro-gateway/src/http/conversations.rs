//! Conversation catalog endpoints: listing, search, history, truncation,
//! and the internal run-item audit view.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use maestro_core::types::{ConversationId, TenantRole};
use maestro_store::conversations::ConversationFilter;
use maestro_store::types::{Conversation, Message, RunItemRow};

use crate::app::AppState;
use crate::auth::gate;
use crate::error::{ApiError, ApiResult};

const MAX_LIST_LIMIT: usize = 200;

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub agent_entrypoint: Option<String>,
    #[serde(default)]
    pub updated_after: Option<String>,
}

#[derive(Serialize)]
pub struct ListReply {
    pub conversations: Vec<Conversation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// GET /api/v1/conversations — keyset listing. Min role: viewer.
pub async fn list_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<ListReply>> {
    let outcome = gate(
        &state.gate,
        &headers,
        TenantRole::Viewer,
        &["conversations:read"],
        false,
    )?;
    let limit = validate_limit(query.limit, 50, MAX_LIST_LIMIT)?;
    let (conversations, next_cursor) = state.store.list_conversations(
        outcome.actor.tenant_id,
        limit,
        query.cursor.as_deref(),
        &ConversationFilter {
            agent_entrypoint: query.agent_entrypoint,
            updated_after: query.updated_after,
        },
    )?;
    Ok(Json(ListReply {
        conversations,
        next_cursor,
    }))
}

#[derive(Deserialize)]
pub struct SearchQuery {
    pub q: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// GET /api/v1/conversations/search — key substring search. Min role: viewer.
pub async fn search_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Json<ListReply>> {
    let outcome = gate(
        &state.gate,
        &headers,
        TenantRole::Viewer,
        &["conversations:read"],
        false,
    )?;
    if query.q.trim().is_empty() {
        return Err(ApiError::validation("q cannot be empty"));
    }
    let limit = validate_limit(query.limit, 20, MAX_LIST_LIMIT)?;
    let conversations =
        state
            .store
            .search_conversations(outcome.actor.tenant_id, &query.q, limit)?;
    Ok(Json(ListReply {
        conversations,
        next_cursor: None,
    }))
}

#[derive(Serialize)]
pub struct HistoryReply {
    pub conversation: Conversation,
    pub messages: Vec<Message>,
}

/// GET /api/v1/conversations/{id} — history of the active segment.
/// Min role: viewer. Cross-tenant reads are indistinguishable from
/// missing conversations.
pub async fn get_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<HistoryReply>> {
    let outcome = gate(
        &state.gate,
        &headers,
        TenantRole::Viewer,
        &["conversations:read"],
        false,
    )?;
    let conversation_id = ConversationId::from_key(&id);
    let conversation = state
        .store
        .get_conversation(outcome.actor.tenant_id, conversation_id)?
        .ok_or_else(|| ApiError::not_found("conversation not found"))?;
    let messages = state
        .store
        .list_messages(outcome.actor.tenant_id, conversation_id)?;
    Ok(Json(HistoryReply {
        conversation,
        messages,
    }))
}

/// DELETE /api/v1/conversations/{id} — truncate into a fresh segment.
/// Min role: admin. Messages stay on disk; user-facing history resets.
pub async fn clear_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let outcome = gate(
        &state.gate,
        &headers,
        TenantRole::Admin,
        &["conversations:delete"],
        false,
    )?;
    let conversation_id = ConversationId::from_key(&id);
    let segment = state
        .store
        .truncate_conversation(outcome.actor.tenant_id, conversation_id)?;
    Ok(Json(json!({
        "status": "truncated",
        "segment_index": segment.segment_index,
    })))
}

#[derive(Serialize)]
pub struct RunEventsReply {
    pub events: Vec<RunItemRow>,
}

/// GET /api/v1/conversations/{id}/events — internal run-item audit rows.
/// Min role: viewer.
pub async fn run_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<RunEventsReply>> {
    let outcome = gate(
        &state.gate,
        &headers,
        TenantRole::Viewer,
        &["conversations:read"],
        false,
    )?;
    let conversation_id = ConversationId::from_key(&id);
    let events = state
        .store
        .list_run_events(outcome.actor.tenant_id, conversation_id)?;
    Ok(Json(RunEventsReply { events }))
}

pub(crate) fn validate_limit(
    requested: Option<usize>,
    default: usize,
    max: usize,
) -> ApiResult<usize> {
    match requested {
        None => Ok(default),
        Some(0) => Err(ApiError::validation("limit must be positive")),
        Some(n) if n > max => Err(ApiError::validation(format!("limit must be <= {max}"))),
        Some(n) => Ok(n),
    }
}
