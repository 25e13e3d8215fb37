// End-to-end API tests over the full router: mock provider runtime,
// in-memory store and object store, real gate, real ledger.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use maestro_core::config::{AuthConfig, MaestroConfig};
use maestro_core::types::{TenantId, TenantRole, UserId};
use maestro_gateway::app::{build_router, AppState};
use maestro_tenancy::tokens::{sign, Claims};

struct Harness {
    router: Router,
    state: Arc<AppState>,
    tenant: TenantId,
    other_tenant: TenantId,
    user: UserId,
}

fn harness() -> Harness {
    let mut config = MaestroConfig::default();
    config.database.path = ":memory:".to_string();
    let state = Arc::new(AppState::build(config).expect("state builds"));

    let tenant = state.store.create_tenant("acme", "Acme").unwrap();
    let other = state.store.create_tenant("rival", "Rival").unwrap();
    let user = state.store.create_user("a@acme.test").unwrap();
    state
        .store
        .upsert_membership(user.id, tenant.id, TenantRole::Admin)
        .unwrap();

    Harness {
        router: build_router(Arc::clone(&state)),
        state,
        tenant: tenant.id,
        other_tenant: other.id,
        user: user.id,
    }
}

fn token_for(user: UserId) -> String {
    token_with_scope(user, "conversations:* workflows:*")
}

fn token_with_scope(user: UserId, scope: &str) -> String {
    let now = chrono::Utc::now().timestamp();
    let auth = AuthConfig::default();
    sign(
        &auth.key_set.active,
        &Claims {
            sub: format!("user:{user}"),
            token_use: "access".to_string(),
            iss: auth.issuer,
            aud: auth.audience,
            iat: now - 5,
            nbf: None,
            exp: now + 300,
            scope: Some(scope.to_string()),
            scopes: None,
            email_verified: Some(true),
        },
    )
    .unwrap()
}

fn request(
    h: &Harness,
    method: &str,
    uri: &str,
    tenant: TenantId,
    body: Option<Value>,
) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token_for(h.user)))
        .header("x-tenant-id", tenant.to_string());
    if body.is_some() {
        builder = builder.header(header::CONTENT_TYPE, "application/json");
    }
    builder
        .body(match body {
            Some(v) => Body::from(v.to_string()),
            None => Body::empty(),
        })
        .unwrap()
}

async fn send(h: &Harness, req: Request<Body>) -> (StatusCode, Value, axum::http::HeaderMap) {
    let response = h.router.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value, headers)
}

async fn send_sse(h: &Harness, req: Request<Body>) -> (StatusCode, Vec<Value>) {
    let response = h.router.clone().oneshot(req).await.unwrap();
    let status = response.status();
    assert!(response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .starts_with("text/event-stream"));
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8_lossy(&bytes);
    let frames = text
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .filter_map(|data| serde_json::from_str(data).ok())
        .collect();
    (status, frames)
}

#[tokio::test]
async fn healthz_is_open() {
    let h = harness();
    let response = h
        .router
        .clone()
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn missing_token_is_unauthenticated() {
    let h = harness();
    let response = h
        .router
        .clone()
        .oneshot(
            Request::get("/api/v1/conversations")
                .header("x-tenant-id", h.tenant.to_string())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok()),
        Some("Bearer")
    );
}

#[tokio::test]
async fn simple_chat_round_trip() {
    let h = harness();
    let (status, body, _) = send(
        &h,
        request(
            &h,
            "POST",
            "/api/v1/chat",
            h.tenant,
            Some(json!({"message": "hi", "agent_type": "triage"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(!body["response"].as_str().unwrap().is_empty());
    let conversation_id = body["conversation_id"].as_str().unwrap().to_string();
    assert!(uuid::Uuid::parse_str(&conversation_id).is_ok());

    let (status, history, _) = send(
        &h,
        request(
            &h,
            "GET",
            &format!("/api/v1/conversations/{conversation_id}"),
            h.tenant,
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let messages = history["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[1]["role"], "assistant");
}

#[tokio::test]
async fn streaming_chat_ends_with_final() {
    let h = harness();
    let (status, frames) = send_sse(
        &h,
        request(
            &h,
            "POST",
            "/api/v1/chat/stream",
            h.tenant,
            Some(json!({"message": "tell me a story"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(!frames.is_empty());
    assert_eq!(frames[0]["kind"], "lifecycle");
    assert!(frames.iter().any(|f| f["kind"] == "raw_response"));

    let last = frames.last().unwrap();
    assert_eq!(last["kind"], "final");
    let concatenated: String = frames
        .iter()
        .filter_map(|f| f["text_delta"].as_str())
        .collect();
    assert_eq!(last["response_text"].as_str().unwrap(), concatenated);
}

#[tokio::test]
async fn cross_tenant_reads_are_not_found() {
    let h = harness();
    let (status, body, _) = send(
        &h,
        request(
            &h,
            "POST",
            "/api/v1/chat",
            h.tenant,
            Some(json!({"message": "hi"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let conversation_id = body["conversation_id"].as_str().unwrap().to_string();

    // same user is also a member of the second tenant
    h.state
        .store
        .upsert_membership(h.user, h.other_tenant, TenantRole::Admin)
        .unwrap();
    let (status, body, _) = send(
        &h,
        request(
            &h,
            "GET",
            &format!("/api/v1/conversations/{conversation_id}"),
            h.other_tenant,
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn ledger_replay_matches_the_stream() {
    let h = harness();
    let (_, frames) = send_sse(
        &h,
        request(
            &h,
            "POST",
            "/api/v1/chat/stream",
            h.tenant,
            Some(json!({"message": "replay me"})),
        ),
    )
    .await;
    let conversation_id = frames[0]["conversation_id"].as_str().unwrap().to_string();

    let (status, replayed) = send_sse(
        &h,
        request(
            &h,
            "GET",
            &format!("/api/v1/conversations/{conversation_id}/ledger/stream"),
            h.tenant,
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(replayed.len(), frames.len());
    for (replay, original) in replayed.iter().zip(&frames) {
        assert_eq!(replay["event_id"], original["event_id"]);
        assert_eq!(replay["server_timestamp"], original["server_timestamp"]);
        // replay runs under a fresh stream id; everything else matches
        assert_ne!(replay["stream_id"], original["stream_id"]);
        let mut a = replay.clone();
        let mut b = original.clone();
        a.as_object_mut().unwrap().remove("stream_id");
        b.as_object_mut().unwrap().remove("stream_id");
        assert_eq!(a, b);
    }
}

#[tokio::test]
async fn ledger_page_limit_is_validated() {
    let h = harness();
    let (status, body, _) = send(
        &h,
        request(
            &h,
            "POST",
            "/api/v1/chat",
            h.tenant,
            Some(json!({"message": "hi"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let conversation_id = body["conversation_id"].as_str().unwrap().to_string();

    let (status, body, _) = send(
        &h,
        request(
            &h,
            "GET",
            &format!("/api/v1/conversations/{conversation_id}/ledger/events?limit=1001"),
            h.tenant,
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "validation");
}

#[tokio::test]
async fn workflow_run_records_ordered_steps() {
    let h = harness();
    let (status, body, _) = send(
        &h,
        request(
            &h,
            "POST",
            "/api/v1/workflows/analysis_code/run",
            h.tenant,
            Some(json!({"message": "summarize today's news"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "succeeded");
    let run_id = body["run_id"].as_str().unwrap().to_string();

    let (status, detail, _) = send(
        &h,
        request(
            &h,
            "GET",
            &format!("/api/v1/workflows/runs/{run_id}"),
            h.tenant,
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let steps = detail["steps"].as_array().unwrap();
    let names: Vec<&str> = steps
        .iter()
        .map(|s| s["step_name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["analysis", "code"]);
}

#[tokio::test]
async fn workflow_stream_carries_workflow_metadata() {
    let h = harness();
    let (status, frames) = send_sse(
        &h,
        request(
            &h,
            "POST",
            "/api/v1/workflows/analysis_code/run-stream",
            h.tenant,
            Some(json!({"message": "go"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let last = frames.last().unwrap();
    assert_eq!(last["kind"], "final");
    assert_eq!(last["workflow"]["workflow_key"], "analysis_code");

    let terminal_count = frames
        .iter()
        .filter(|f| f["kind"] == "final" || f["kind"] == "error")
        .count();
    assert_eq!(terminal_count, 1);
}

#[tokio::test]
async fn downscoped_viewer_cannot_chat() {
    let h = harness();
    let mut req = request(
        &h,
        "POST",
        "/api/v1/chat",
        h.tenant,
        Some(json!({"message": "hi"})),
    );
    req.headers_mut()
        .insert("x-tenant-role", "viewer".parse().unwrap());
    let (status, body, _) = send(&h, req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "forbidden");
}

#[tokio::test]
async fn scopes_are_bound_per_route() {
    let h = harness();
    // conversations:read alone can list conversations...
    let token = token_with_scope(h.user, "conversations:read");
    let response = h
        .router
        .clone()
        .oneshot(
            Request::get("/api/v1/conversations")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .header("x-tenant-id", h.tenant.to_string())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // ...but cannot post a chat turn (conversations:write) or run a
    // workflow (workflows:write)
    for (method, uri) in [
        ("POST", "/api/v1/chat"),
        ("POST", "/api/v1/workflows/analysis_code/run"),
    ] {
        let response = h
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
                    .header("x-tenant-id", h.tenant.to_string())
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(json!({"message": "hi"}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN, "{method} {uri}");
    }
}

#[tokio::test]
async fn support_superuser_scope_passes_every_route() {
    let h = harness();
    let token = token_with_scope(h.user, "support:*");
    let response = h
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/chat")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .header("x-tenant-id", h.tenant.to_string())
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({"message": "hi"}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn empty_message_is_a_validation_error() {
    let h = harness();
    let (status, body, _) = send(
        &h,
        request(
            &h,
            "POST",
            "/api/v1/chat",
            h.tenant,
            Some(json!({"message": "   "})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "validation");
}

#[tokio::test]
async fn unknown_agent_streams_are_refused_up_front() {
    let h = harness();
    let response = h
        .router
        .clone()
        .oneshot(request(
            &h,
            "POST",
            "/api/v1/chat/stream",
            h.tenant,
            Some(json!({"message": "hi", "agent_type": "ghost"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
