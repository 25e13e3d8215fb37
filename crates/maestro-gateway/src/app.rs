use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use maestro_core::config::MaestroConfig;
use maestro_engine::ExecutionEngine;
use maestro_guardrails::{resolve_pipeline, GuardrailRegistry, GuardrailRuntime};
use maestro_ledger::{LedgerReader, LedgerWriter};
use maestro_providers::ProviderRegistry;
use maestro_sessions::{SessionManager, SessionPolicy};
use maestro_store::Store;
use maestro_tenancy::TenantGate;
use maestro_workflows::{WorkflowRegistry, WorkflowService};

use crate::http;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
///
/// Built once at startup after config validation and torn down with the
/// process; there are no package-level singletons behind it.
pub struct AppState {
    pub config: MaestroConfig,
    pub gate: TenantGate,
    pub store: Arc<Store>,
    pub providers: Arc<ProviderRegistry>,
    pub engine: Arc<ExecutionEngine>,
    pub workflows: Arc<WorkflowService>,
    pub ledger_reader: Arc<LedgerReader>,
}

impl AppState {
    pub fn build(config: MaestroConfig) -> anyhow::Result<Self> {
        let store = if config.database.path == ":memory:" {
            Arc::new(Store::open_in_memory()?)
        } else {
            Arc::new(Store::open(&config.database.path)?)
        };
        let objects = maestro_storage::build(&config.object_store)?;
        let providers = Arc::new(ProviderRegistry::from_config(&config)?);
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&store),
            SessionPolicy::from(&config.session),
        ));
        let guardrail_registry = GuardrailRegistry::builtin();
        let pipeline = resolve_pipeline(&guardrail_registry, &config.guardrails)?;
        let ledger_writer = Arc::new(LedgerWriter::new(
            Arc::clone(&store),
            Arc::clone(&objects),
            &config.ledger,
        ));
        let ledger_reader = Arc::new(LedgerReader::new(Arc::clone(&store), Arc::clone(&objects)));
        let engine = Arc::new(ExecutionEngine::new(
            Arc::clone(&providers),
            sessions,
            Arc::clone(&store),
            objects,
            Arc::new(GuardrailRuntime::new(pipeline)),
            Arc::clone(&ledger_writer),
        ));
        let workflow_registry = Arc::new(WorkflowRegistry::builtin(&providers)?);
        let workflows = Arc::new(WorkflowService::new(
            workflow_registry,
            Arc::clone(&engine),
            Arc::clone(&store),
            ledger_writer,
        ));
        let gate = TenantGate::new(&config, Arc::clone(&store));

        Ok(Self {
            config,
            gate,
            store,
            providers,
            engine,
            workflows,
            ledger_reader,
        })
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = if state.config.server.cors_origins.is_empty() {
        CorsLayer::new()
    } else {
        let origins: Vec<axum::http::HeaderValue> = state
            .config
            .server
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_headers(tower_http::cors::Any)
            .allow_methods(tower_http::cors::Any)
    };

    Router::new()
        .route("/healthz", get(http::health::healthz))
        .route("/api/v1/chat", post(http::chat::chat))
        .route("/api/v1/chat/stream", post(http::chat::chat_stream))
        .route(
            "/api/v1/conversations",
            get(http::conversations::list_conversations),
        )
        .route(
            "/api/v1/conversations/search",
            get(http::conversations::search_conversations),
        )
        .route(
            "/api/v1/conversations/{id}",
            get(http::conversations::get_conversation)
                .delete(http::conversations::clear_conversation),
        )
        .route(
            "/api/v1/conversations/{id}/events",
            get(http::conversations::run_events),
        )
        .route(
            "/api/v1/conversations/{id}/ledger/events",
            get(http::ledger::ledger_events),
        )
        .route(
            "/api/v1/conversations/{id}/ledger/stream",
            get(http::ledger::ledger_stream),
        )
        .route("/api/v1/workflows", get(http::workflows::list_workflows))
        .route(
            "/api/v1/workflows/{key}/run",
            post(http::workflows::run_workflow),
        )
        .route(
            "/api/v1/workflows/{key}/run-stream",
            post(http::workflows::run_workflow_stream),
        )
        .route(
            "/api/v1/workflows/runs/{run_id}",
            get(http::workflows::run_detail),
        )
        .route(
            "/api/v1/workflows/runs/{run_id}/cancel",
            post(http::workflows::cancel_run),
        )
        .route(
            "/api/v1/workflows/runs/{run_id}/replay/events",
            get(http::workflows::replay_events),
        )
        .route(
            "/api/v1/workflows/runs/{run_id}/replay/stream",
            get(http::workflows::replay_stream),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
