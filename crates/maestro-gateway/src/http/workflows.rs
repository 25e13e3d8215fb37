//! Workflow endpoints: catalog, runs (both modes), cancellation, replay.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::warn;

use maestro_core::config::MAX_LEDGER_PAGE_LIMIT;
use maestro_core::types::{TenantRole, WorkflowRunId};
use maestro_ledger::cursor::LedgerCursor;
use maestro_protocol::frames::new_stream_id;
use maestro_store::types::{WorkflowRun, WorkflowStepRow};
use maestro_workflows::{WorkflowDescriptor, WorkflowRunRequest};

use crate::app::AppState;
use crate::auth::gate;
use crate::error::{ApiError, ApiResult};
use crate::http::conversations::validate_limit;
use crate::http::ledger::rewrite_stream_id;
use crate::http::sse;

#[derive(Serialize)]
pub struct CatalogReply {
    pub workflows: Vec<WorkflowDescriptor>,
}

/// GET /api/v1/workflows — the validated workflow catalog. Min role: viewer.
pub async fn list_workflows(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<CatalogReply>> {
    gate(
        &state.gate,
        &headers,
        TenantRole::Viewer,
        &["workflows:read"],
        false,
    )?;
    Ok(Json(CatalogReply {
        workflows: state.workflows.list(),
    }))
}

#[derive(Deserialize)]
pub struct RunBody {
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub location: Option<Value>,
    #[serde(default)]
    pub share_location: Option<bool>,
}

#[derive(Serialize)]
pub struct RunReply {
    pub run_id: String,
    pub conversation_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_output_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_output_structured: Option<Value>,
}

fn run_request(body: RunBody, actor: maestro_core::types::ActorContext) -> ApiResult<WorkflowRunRequest> {
    if body.message.trim().is_empty() {
        return Err(ApiError::validation("message cannot be empty"));
    }
    Ok(WorkflowRunRequest {
        actor,
        message: body.message,
        conversation_key: body.conversation_id,
        cancel: tokio_util::sync::CancellationToken::new(),
    })
}

/// POST /api/v1/workflows/{key}/run — non-streaming run. Min role: member.
pub async fn run_workflow(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(key): Path<String>,
    Json(body): Json<RunBody>,
) -> ApiResult<Json<RunReply>> {
    let outcome = gate(
        &state.gate,
        &headers,
        TenantRole::Member,
        &["workflows:write"],
        true,
    )?;
    let req = run_request(body, outcome.actor)?;
    let result = state.workflows.run(&key, req).await?;
    Ok(Json(RunReply {
        run_id: result.run_id.to_string(),
        conversation_id: result.conversation_id.to_string(),
        status: result.status.as_str().to_string(),
        final_output_text: result.final_output_text,
        final_output_structured: result.final_output_structured,
    }))
}

/// POST /api/v1/workflows/{key}/run-stream — SSE run. Min role: member.
pub async fn run_workflow_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(key): Path<String>,
    Json(body): Json<RunBody>,
) -> ApiResult<impl IntoResponse> {
    let outcome = gate(
        &state.gate,
        &headers,
        TenantRole::Member,
        &["workflows:write"],
        true,
    )?;
    // reject unknown workflows before the stream starts
    if state.workflows.list().iter().all(|w| w.key != key) {
        return Err(ApiError::not_found(format!("workflow '{key}' not found")));
    }
    let req = run_request(body, outcome.actor)?;
    let cancel = req.cancel.clone();

    let (tx, rx) = mpsc::channel(256);
    let workflows = Arc::clone(&state.workflows);
    tokio::spawn(async move {
        if let Err(e) = workflows.run_stream(&key, req, tx).await {
            warn!(error = %e, "streaming workflow run failed");
        }
    });

    Ok(sse::frame_response(
        rx,
        cancel,
        state.config.stream.heartbeat_interval_s,
    ))
}

#[derive(Serialize)]
pub struct RunDetailReply {
    pub run: WorkflowRun,
    pub steps: Vec<WorkflowStepRow>,
}

/// GET /api/v1/workflows/runs/{run_id} — run detail. Min role: viewer.
pub async fn run_detail(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RunDetailReply>> {
    let outcome = gate(
        &state.gate,
        &headers,
        TenantRole::Viewer,
        &["workflows:read"],
        false,
    )?;
    let run_id = parse_run_id(&run_id)?;
    let (run, steps) = state.workflows.get_run(outcome.actor.tenant_id, run_id)?;
    Ok(Json(RunDetailReply { run, steps }))
}

/// POST /api/v1/workflows/runs/{run_id}/cancel — cancel an in-flight run.
/// Min role: admin. Cancelling a terminated run is a no-op.
pub async fn cancel_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let outcome = gate(
        &state.gate,
        &headers,
        TenantRole::Admin,
        &["workflows:write"],
        false,
    )?;
    let run_id = parse_run_id(&run_id)?;
    let cancelled = state.workflows.cancel(outcome.actor.tenant_id, run_id)?;
    Ok(Json(json!({"cancelled": cancelled})))
}

#[derive(Deserialize)]
pub struct ReplayQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Serialize)]
pub struct ReplayPage {
    pub events: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// GET /api/v1/workflows/runs/{run_id}/replay/events — paginated run
/// replay. Min role: viewer.
pub async fn replay_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
    Query(query): Query<ReplayQuery>,
) -> ApiResult<Json<ReplayPage>> {
    let outcome = gate(
        &state.gate,
        &headers,
        TenantRole::Viewer,
        &["workflows:read"],
        false,
    )?;
    let run_id = parse_run_id(&run_id)?;
    let (run, _) = state.workflows.get_run(outcome.actor.tenant_id, run_id)?;
    let limit = validate_limit(query.limit, 100, MAX_LEDGER_PAGE_LIMIT)?;
    let (events, next_cursor) = state
        .ledger_reader
        .get_events_page(
            outcome.actor.tenant_id,
            run.conversation_id,
            Some(&run.id),
            limit,
            query.cursor.as_deref(),
        )
        .await?;
    Ok(Json(ReplayPage {
        events,
        next_cursor,
    }))
}

/// GET /api/v1/workflows/runs/{run_id}/replay/stream — SSE run replay.
/// Min role: viewer.
pub async fn replay_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
    Query(query): Query<ReplayQuery>,
) -> ApiResult<impl IntoResponse> {
    let outcome = gate(
        &state.gate,
        &headers,
        TenantRole::Viewer,
        &["workflows:read"],
        false,
    )?;
    let run_id = parse_run_id(&run_id)?;
    let (run, _) = state.workflows.get_run(outcome.actor.tenant_id, run_id)?;
    let cursor = query
        .cursor
        .as_deref()
        .map(LedgerCursor::decode)
        .transpose()
        .map_err(|_| ApiError::validation("invalid cursor"))?;

    let replay_stream_id = new_stream_id();
    let frames = Arc::clone(&state.ledger_reader)
        .replay_json(run.conversation_id, Some(run.id.clone()), cursor)
        .filter_map(move |result| {
            let replay_stream_id = replay_stream_id.clone();
            async move {
                match result {
                    Ok(json) => Some(rewrite_stream_id(&json, &replay_stream_id)),
                    Err(e) => {
                        warn!(error = %e, "workflow replay read failed");
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

fn parse_run_id(raw: &str) -> ApiResult<WorkflowRunId> {
    WorkflowRunId::parse(raw).ok_or_else(|| ApiError::validation("invalid run id"))
}
