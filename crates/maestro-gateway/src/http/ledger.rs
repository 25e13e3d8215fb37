//! Durable ledger endpoints: paginated frame reads and SSE replay.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use maestro_core::config::MAX_LEDGER_PAGE_LIMIT;
use maestro_core::types::{ConversationId, TenantRole};
use maestro_ledger::cursor::LedgerCursor;
use maestro_protocol::frames::new_stream_id;

use crate::app::AppState;
use crate::auth::gate;
use crate::error::{ApiError, ApiResult};
use crate::http::conversations::validate_limit;
use crate::http::sse;

#[derive(Deserialize)]
pub struct LedgerQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub workflow_run_id: Option<String>,
}

#[derive(Serialize)]
pub struct LedgerPage {
    pub events: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// GET /api/v1/conversations/{id}/ledger/events — one ordered page of
/// recorded frames. Min role: viewer. Limit 1..=1000.
pub async fn ledger_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<LedgerQuery>,
) -> ApiResult<Json<LedgerPage>> {
    let outcome = gate(
        &state.gate,
        &headers,
        TenantRole::Viewer,
        &["conversations:read"],
        false,
    )?;
    let limit = validate_limit(query.limit, 100, MAX_LEDGER_PAGE_LIMIT)?;
    let conversation_id = ConversationId::from_key(&id);
    let (events, next_cursor) = state
        .ledger_reader
        .get_events_page(
            outcome.actor.tenant_id,
            conversation_id,
            query.workflow_run_id.as_deref(),
            limit,
            query.cursor.as_deref(),
        )
        .await?;
    Ok(Json(LedgerPage {
        events,
        next_cursor,
    }))
}

/// GET /api/v1/conversations/{id}/ledger/stream — SSE replay of the
/// recorded frames. Min role: viewer.
///
/// Tenant scoping and cursor validity are preflighted so failures are
/// proper HTTP errors rather than broken streams. Replay preserves
/// `event_id` and `server_timestamp` but assigns a fresh `stream_id`.
pub async fn ledger_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<LedgerQuery>,
) -> ApiResult<impl IntoResponse> {
    let outcome = gate(
        &state.gate,
        &headers,
        TenantRole::Viewer,
        &["conversations:read"],
        false,
    )?;
    let conversation_id = ConversationId::from_key(&id);
    state
        .ledger_reader
        .check_access(outcome.actor.tenant_id, conversation_id)?;
    let cursor = query
        .cursor
        .as_deref()
        .map(LedgerCursor::decode)
        .transpose()
        .map_err(|_| ApiError::validation("invalid cursor"))?;

    let replay_stream_id = new_stream_id();
    let frames = Arc::clone(&state.ledger_reader)
        .replay_json(conversation_id, query.workflow_run_id.clone(), cursor)
        .filter_map(move |result| {
            let replay_stream_id = replay_stream_id.clone();
            async move {
                match result {
                    Ok(json) => Some(rewrite_stream_id(&json, &replay_stream_id)),
                    Err(e) => {
                        // mid-stream failures surface as a truncated replay
                        tracing::warn!(error = %e, "ledger replay read failed");
                        None
                    }
                }
            }
        });

    Ok(sse::json_response(
        frames,
        state.config.stream.heartbeat_interval_s,
    ))
}

/// Swap the recorded `stream_id` for the replay delivery's id, leaving
/// every other byte of the recorded frame as it was.
pub(crate) fn rewrite_stream_id(json: &str, stream_id: &str) -> String {
    match serde_json::from_str::<Value>(json) {
        Ok(mut value) => {
            if let Some(obj) = value.as_object_mut() {
                obj.insert("stream_id".to_string(), Value::String(stream_id.to_string()));
            }
            serde_json::to_string(&value).unwrap_or_else(|_| json.to_string())
        }
        Err(_) => json.to_string(),
    }
}
