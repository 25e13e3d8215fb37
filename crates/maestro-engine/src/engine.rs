//! Agent execution engine: one shared pipeline for chat turns, consumed
//! by the HTTP boundary and the workflow runner. Channel adapters stay
//! thin; resolution, sessions, guardrails, provider invocation, ledger
//! recording, and finalization all live here, once.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use maestro_core::types::{ActorContext, ConversationId};
use maestro_guardrails::{ExecutedGuardrail, GuardrailRuntime, GuardrailStage};
use maestro_ledger::LedgerWriter;
use maestro_protocol::frames::{
    FrameEnvelope, GuardrailOutcome, MessageAttachment, StreamFrame, WorkflowMeta,
};
use maestro_providers::{
    AgentDescriptor, AgentRunRequest, AgentStreamEvent, MemoryStrategyConfig, ProviderRegistry,
    RunItem, TokenUsage,
};
use maestro_sessions::SessionManager;
use maestro_storage::ObjectStore;
use maestro_store::Store;

use crate::attachments::{self, ContainerFileGateway, InputAttachment};
use crate::error::{EngineError, Result};
use crate::processor::build_frame;
use crate::recorder::{self, RunRecord};

/// One agent turn.
pub struct ChatRequest {
    pub actor: ActorContext,
    pub agent_key: Option<String>,
    pub conversation_key: Option<String>,
    pub message: String,
    pub attachments: Vec<InputAttachment>,
    pub memory_strategy: Option<MemoryStrategyConfig>,
    pub workflow: Option<WorkflowMeta>,
    pub cancel: CancellationToken,
    /// Workflow streams suppress the per-step terminal; the runner emits
    /// the single workflow terminal itself.
    pub emit_terminal: bool,
    /// Reuse an existing physical stream id (workflow steps share one).
    pub stream_id: Option<String>,
    /// Caller location context, forwarded to the provider as metadata
    /// when the caller opted into sharing it.
    pub location_hint: Option<Value>,
}

impl ChatRequest {
    pub fn new(actor: ActorContext, message: impl Into<String>) -> Self {
        Self {
            actor,
            agent_key: None,
            conversation_key: None,
            message: message.into(),
            attachments: Vec::new(),
            memory_strategy: None,
            workflow: None,
            cancel: CancellationToken::new(),
            emit_terminal: true,
            stream_id: None,
            location_hint: None,
        }
    }
}

/// Completed turn, shared by the streaming and non-streaming paths.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub conversation_id: ConversationId,
    pub conversation_key: String,
    pub agent: String,
    pub response_id: Option<String>,
    pub response_text: String,
    pub structured_output: Option<Value>,
    pub usage: TokenUsage,
}

pub struct ExecutionEngine {
    registry: Arc<ProviderRegistry>,
    sessions: Arc<SessionManager>,
    store: Arc<Store>,
    objects: Arc<dyn ObjectStore>,
    guardrails: Arc<GuardrailRuntime>,
    ledger: Arc<LedgerWriter>,
    container_files: Option<Arc<dyn ContainerFileGateway>>,
}

impl ExecutionEngine {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        sessions: Arc<SessionManager>,
        store: Arc<Store>,
        objects: Arc<dyn ObjectStore>,
        guardrails: Arc<GuardrailRuntime>,
        ledger: Arc<LedgerWriter>,
    ) -> Self {
        Self {
            registry,
            sessions,
            store,
            objects,
            guardrails,
            ledger,
            container_files: None,
        }
    }

    pub fn with_container_files(mut self, gateway: Arc<dyn ContainerFileGateway>) -> Self {
        self.container_files = Some(gateway);
        self
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Normalize the conversation identity and make sure the row exists.
    fn resolve_conversation(
        &self,
        req: &ChatRequest,
        agent_key: &str,
    ) -> Result<(ConversationId, String)> {
        let key = req
            .conversation_key
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let id = ConversationId::from_key(&key);
        self.store
            .get_or_create_conversation(req.actor.tenant_id, id, &key, Some(agent_key))?;
        Ok((id, key))
    }

    /// Non-streaming turn.
    pub async fn run(&self, req: ChatRequest) -> Result<ChatOutcome> {
        let descriptor = self.registry.resolve(req.agent_key.as_deref())?;
        let (conversation_id, conversation_key) = self.resolve_conversation(&req, &descriptor.key)?;

        for stage in [GuardrailStage::PreFlight, GuardrailStage::Input] {
            let outcome = self.guardrails.run_stage(stage, &req.message).await?;
            if let Some(blocked) = outcome.blocked {
                return Err(guardrail_error(&blocked));
            }
        }

        let (input_items, user_attachments) =
            attachments::resolve_input(&self.objects, &req.attachments).await?;

        let provider = self.registry.provider();
        let state = self
            .store
            .get_session_state(req.actor.tenant_id, conversation_id)?;
        let provider_conversation_id = self
            .sessions
            .resolve_provider_conversation_id(
                provider.as_ref(),
                &req.actor,
                conversation_id,
                state.as_ref(),
            )
            .await;
        let memory = req
            .memory_strategy
            .clone()
            .or_else(|| descriptor.memory_strategy_default.clone());
        let (session_id, session) = self
            .sessions
            .acquire_session(
                provider.as_ref(),
                req.actor.tenant_id,
                conversation_id,
                provider_conversation_id.as_deref(),
                memory,
                Some(&descriptor.key),
                None,
            )
            .await?;

        info!(
            conversation_id = %conversation_id,
            agent = %descriptor.key,
            provider = provider.name(),
            "processing chat request"
        );
        let resp = provider
            .run(AgentRunRequest {
                agent: descriptor.clone(),
                message: req.message.clone(),
                input_items,
                session,
                provider_conversation_id: provider_conversation_id.clone(),
                conversation_id: conversation_id.to_string(),
                metadata: request_metadata(&req),
            })
            .await?;

        let mut run_items = resp.run_items;
        for item in &mut run_items {
            if item.item_type == "tool_call" {
                if let Some(arguments) = &item.call_arguments {
                    let outcome = self
                        .guardrails
                        .run_stage(GuardrailStage::ToolInput, &arguments.to_string())
                        .await?;
                    if let Some(blocked) = outcome.blocked {
                        return Err(guardrail_error(&blocked));
                    }
                }
            }
            if item.item_type == "tool_output" {
                if let Some(output) = &item.call_output {
                    let content = match output {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    let outcome = self
                        .guardrails
                        .run_stage(GuardrailStage::ToolOutput, &content)
                        .await?;
                    if let Some(redacted) = outcome.redacted_content {
                        item.call_output = Some(Value::String(redacted));
                    }
                }
            }
        }

        let output = self
            .guardrails
            .run_stage(GuardrailStage::Output, &resp.response_text)
            .await?;
        let response_text = output
            .redacted_content
            .unwrap_or_else(|| resp.response_text.clone());

        recorder::finalize(
            &self.store,
            &self.sessions,
            &RunRecord {
                actor: req.actor,
                conversation_id,
                agent_key: &descriptor.key,
                model: &descriptor.model,
                provider_name: provider.name(),
                response_id: Some(&resp.response_id),
                user_message: &req.message,
                user_attachments: &user_attachments,
                assistant_text: &response_text,
                assistant_attachments: &[],
                run_items: &run_items,
                usage: resp.usage,
                workflow_run_id: req
                    .workflow
                    .as_ref()
                    .map(|w| w.workflow_run_id.as_str()),
                session_id: &session_id,
                provider_conversation_id: provider_conversation_id.as_deref(),
            },
        )?;

        Ok(ChatOutcome {
            conversation_id,
            conversation_key,
            agent: descriptor.key,
            response_id: Some(resp.response_id),
            response_text,
            structured_output: resp.structured_output,
            usage: resp.usage,
        })
    }

    /// Streaming turn. Every frame is ledger-recorded before delivery;
    /// exactly one terminal frame is emitted, also on cancellation and
    /// error (unless the caller owns the terminal).
    pub async fn run_stream(
        &self,
        req: ChatRequest,
        tx: mpsc::Sender<StreamFrame>,
    ) -> Result<ChatOutcome> {
        let descriptor = self.registry.resolve(req.agent_key.as_deref())?;
        let (conversation_id, conversation_key) = self.resolve_conversation(&req, &descriptor.key)?;

        let mut env = FrameEnvelope::new(conversation_id.to_string()).with_agent(&descriptor.key);
        if let Some(stream_id) = &req.stream_id {
            env.stream_id = stream_id.clone();
        }
        if let Some(workflow) = &req.workflow {
            env = env.with_workflow(workflow.clone());
        }
        let workflow_run_id = req.workflow.as_ref().map(|w| w.workflow_run_id.clone());

        let driven = self
            .drive(&req, &descriptor, &env, conversation_id, workflow_run_id.as_deref(), &tx)
            .await;

        match driven {
            Ok(drive) => {
                if req.emit_terminal {
                    self.emit(
                        &tx,
                        req.actor.tenant_id,
                        conversation_id,
                        workflow_run_id.as_deref(),
                        |id| {
                            env.final_frame(
                                id,
                                Some(drive.response_text.clone()),
                                drive.structured_output.clone(),
                                drive.response_id.clone(),
                            )
                        },
                    )
                    .await?;
                }

                // Failures past the terminal never reach the client.
                if let Err(e) = recorder::finalize(
                    &self.store,
                    &self.sessions,
                    &RunRecord {
                        actor: req.actor,
                        conversation_id,
                        agent_key: &descriptor.key,
                        model: &descriptor.model,
                        provider_name: self.registry.provider().name(),
                        response_id: drive.response_id.as_deref(),
                        user_message: &req.message,
                        user_attachments: &drive.user_attachments,
                        assistant_text: &drive.response_text,
                        assistant_attachments: &drive.assistant_attachments,
                        run_items: &drive.run_items,
                        usage: drive.usage,
                        workflow_run_id: workflow_run_id.as_deref(),
                        session_id: &drive.session_id,
                        provider_conversation_id: drive.provider_conversation_id.as_deref(),
                    },
                ) {
                    warn!(error = %e, "stream finalization failed");
                }

                Ok(ChatOutcome {
                    conversation_id,
                    conversation_key,
                    agent: descriptor.key,
                    response_id: drive.response_id,
                    response_text: drive.response_text,
                    structured_output: drive.structured_output,
                    usage: drive.usage,
                })
            }
            Err(e) => {
                if req.emit_terminal {
                    let code = e.code();
                    let message = e.to_string();
                    if let Err(emit_err) = self
                        .emit(
                            &tx,
                            req.actor.tenant_id,
                            conversation_id,
                            workflow_run_id.as_deref(),
                            |id| env.error_frame(id, code, message.clone()),
                        )
                        .await
                    {
                        warn!(error = %emit_err, "failed to emit terminal error frame");
                    }
                }
                Err(e)
            }
        }
    }

    /// Record a frame to the ledger and deliver it.
    async fn emit<F>(
        &self,
        tx: &mpsc::Sender<StreamFrame>,
        tenant_id: maestro_core::types::TenantId,
        conversation_id: ConversationId,
        workflow_run_id: Option<&str>,
        build: F,
    ) -> Result<StreamFrame>
    where
        F: FnOnce(u64) -> StreamFrame,
    {
        let frame = self
            .ledger
            .record(tenant_id, conversation_id, workflow_run_id, build)
            .await?;
        let _ = tx.send(frame.clone()).await;
        Ok(frame)
    }

    /// Run a blocking guardrail stage, emitting result frames.
    async fn blocking_stage(
        &self,
        stage: GuardrailStage,
        content: &str,
        env: &FrameEnvelope,
        req: &ChatRequest,
        conversation_id: ConversationId,
        workflow_run_id: Option<&str>,
        tx: &mpsc::Sender<StreamFrame>,
    ) -> Result<()> {
        let outcome = self.guardrails.run_stage(stage, content).await?;
        for executed in &outcome.results {
            self.emit(
                tx,
                req.actor.tenant_id,
                conversation_id,
                workflow_run_id,
                |id| env.guardrail_result(id, guardrail_frame(executed)),
            )
            .await?;
        }
        if let Some(blocked) = outcome.blocked {
            return Err(guardrail_error(&blocked));
        }
        Ok(())
    }

    /// Run tool_output guardrails over a tool item's output; triggered
    /// checks replace the matched spans.
    async fn tool_output_stage(
        &self,
        item: &RunItem,
        env: &FrameEnvelope,
        req: &ChatRequest,
        conversation_id: ConversationId,
        workflow_run_id: Option<&str>,
        tx: &mpsc::Sender<StreamFrame>,
    ) -> Result<Option<String>> {
        let Some(output) = &item.call_output else {
            return Ok(None);
        };
        let content = match output {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let outcome = self
            .guardrails
            .run_stage(GuardrailStage::ToolOutput, &content)
            .await?;
        for executed in &outcome.results {
            self.emit(tx, req.actor.tenant_id, conversation_id, workflow_run_id, |id| {
                env.guardrail_result(id, guardrail_frame(executed))
            })
            .await?;
        }
        Ok(outcome.redacted_content)
    }

    async fn drive(
        &self,
        req: &ChatRequest,
        descriptor: &AgentDescriptor,
        env: &FrameEnvelope,
        conversation_id: ConversationId,
        workflow_run_id: Option<&str>,
        tx: &mpsc::Sender<StreamFrame>,
    ) -> Result<DriveOutput> {
        let tenant_id = req.actor.tenant_id;

        self.blocking_stage(
            GuardrailStage::PreFlight,
            &req.message,
            env,
            req,
            conversation_id,
            workflow_run_id,
            tx,
        )
        .await?;
        self.blocking_stage(
            GuardrailStage::Input,
            &req.message,
            env,
            req,
            conversation_id,
            workflow_run_id,
            tx,
        )
        .await?;

        let (input_items, user_attachments) =
            attachments::resolve_input(&self.objects, &req.attachments).await?;

        let provider = self.registry.provider();
        let state = self.store.get_session_state(tenant_id, conversation_id)?;
        let provider_conversation_id = self
            .sessions
            .resolve_provider_conversation_id(
                provider.as_ref(),
                &req.actor,
                conversation_id,
                state.as_ref(),
            )
            .await;
        let (compaction_tx, mut compaction_rx) = mpsc::channel(8);
        let memory = req
            .memory_strategy
            .clone()
            .or_else(|| descriptor.memory_strategy_default.clone());
        let (session_id, session) = self
            .sessions
            .acquire_session(
                provider.as_ref(),
                tenant_id,
                conversation_id,
                provider_conversation_id.as_deref(),
                memory,
                Some(&descriptor.key),
                Some(compaction_tx),
            )
            .await?;

        self.emit(tx, tenant_id, conversation_id, workflow_run_id, |id| {
            env.lifecycle(id, "run_started", json!({"status": "in_progress"}))
        })
        .await?;

        info!(
            conversation_id = %conversation_id,
            agent = %descriptor.key,
            provider = provider.name(),
            "processing streaming chat request"
        );

        let (provider_tx, mut provider_rx) = mpsc::channel::<AgentStreamEvent>(64);
        let run_request = AgentRunRequest {
            agent: descriptor.clone(),
            message: req.message.clone(),
            input_items,
            session,
            provider_conversation_id: provider_conversation_id.clone(),
            conversation_id: conversation_id.to_string(),
            metadata: request_metadata(req),
        };
        let provider_task = {
            let provider = Arc::clone(&provider);
            let err_tx = provider_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = provider.run_stream(run_request, err_tx.clone()).await {
                    let _ = err_tx
                        .send(AgentStreamEvent::Error {
                            code: e.kind().code().to_string(),
                            message: e.to_string(),
                        })
                        .await;
                }
            })
        };
        drop(provider_tx);

        let mut run_items: Vec<RunItem> = Vec::new();
        let mut assistant_attachments: Vec<MessageAttachment> = Vec::new();
        let mut seen_tool_calls: HashSet<String> = HashSet::new();
        let mut seen_container_files: HashSet<String> = HashSet::new();
        let mut terminal: Option<(Option<String>, Option<String>, Option<Value>, TokenUsage)> =
            None;

        loop {
            tokio::select! {
                biased;
                _ = req.cancel.cancelled() => {
                    provider_task.abort();
                    return Err(EngineError::Cancelled);
                }
                Some(compaction) = compaction_rx.recv() => {
                    self.emit(tx, tenant_id, conversation_id, workflow_run_id, |id| {
                        env.lifecycle(id, "memory_compaction", json!({
                            "compacted_count": compaction.compacted_count,
                            "summary_length_tokens": compaction.summary_length_tokens,
                        }))
                    })
                    .await?;
                }
                event = provider_rx.recv() => {
                    match event {
                        None => {
                            return Err(EngineError::Internal(
                                "provider stream ended without a terminal event".to_string(),
                            ));
                        }
                        Some(AgentStreamEvent::Final {
                            response_id,
                            response_text,
                            structured_output,
                            usage,
                        }) => {
                            terminal = Some((response_id, response_text, structured_output, usage));
                            break;
                        }
                        Some(AgentStreamEvent::Error { code, message }) => {
                            if code == "cancelled" {
                                return Err(EngineError::Cancelled);
                            }
                            return Err(EngineError::Provider(
                                maestro_providers::ProviderError::Unavailable(format!(
                                    "{code}: {message}"
                                )),
                            ));
                        }
                        Some(AgentStreamEvent::RunItem(mut item)) => {
                            // tool stages run around the tool items themselves
                            if item.item_type == "tool_call" {
                                if let Some(arguments) = &item.call_arguments {
                                    self.blocking_stage(
                                        GuardrailStage::ToolInput,
                                        &arguments.to_string(),
                                        env,
                                        req,
                                        conversation_id,
                                        workflow_run_id,
                                        tx,
                                    )
                                    .await?;
                                }
                            }
                            if item.item_type == "tool_output" {
                                if let Some(redacted) = self
                                    .tool_output_stage(&item, env, req, conversation_id, workflow_run_id, tx)
                                    .await?
                                {
                                    item.call_output = Some(Value::String(redacted));
                                }
                            }
                            let mut extra: Vec<MessageAttachment> = Vec::new();
                            if let Some(stored) = attachments::persist_output_image(
                                &self.objects,
                                tenant_id,
                                &item,
                                &mut seen_tool_calls,
                            )
                            .await?
                            {
                                extra.push(stored);
                            }
                            if let (Some(gateway), Some(annotations)) =
                                (self.container_files.as_ref(), item.annotations.as_ref())
                            {
                                extra.extend(
                                    attachments::ingest_container_citations(
                                        &self.objects,
                                        gateway,
                                        tenant_id,
                                        annotations,
                                        &mut seen_container_files,
                                    )
                                    .await,
                                );
                            }
                            assistant_attachments.extend(extra.iter().cloned());
                            run_items.push((*item).clone());
                            let event = AgentStreamEvent::RunItem(item);
                            self.emit(tx, tenant_id, conversation_id, workflow_run_id, |id| {
                                build_frame(env, &event, id, Some(extra))
                            })
                            .await?;
                        }
                        Some(event) => {
                            self.emit(tx, tenant_id, conversation_id, workflow_run_id, |id| {
                                build_frame(env, &event, id, None)
                            })
                            .await?;
                        }
                    }
                }
            }
        }

        let (response_id, response_text, structured_output, usage) =
            terminal.unwrap_or((None, None, None, TokenUsage::default()));
        let response_text = response_text.unwrap_or_default();

        // Output guardrails: run everything, redact matched spans.
        let output = self
            .guardrails
            .run_stage(GuardrailStage::Output, &response_text)
            .await?;
        for executed in &output.results {
            self.emit(tx, tenant_id, conversation_id, workflow_run_id, |id| {
                env.guardrail_result(id, guardrail_frame(executed))
            })
            .await?;
        }
        let response_text = output.redacted_content.unwrap_or(response_text);

        Ok(DriveOutput {
            response_id,
            response_text,
            structured_output,
            usage,
            run_items,
            user_attachments,
            assistant_attachments,
            session_id,
            provider_conversation_id,
        })
    }
}

struct DriveOutput {
    response_id: Option<String>,
    response_text: String,
    structured_output: Option<Value>,
    usage: TokenUsage,
    run_items: Vec<RunItem>,
    user_attachments: Vec<MessageAttachment>,
    assistant_attachments: Vec<MessageAttachment>,
    session_id: String,
    provider_conversation_id: Option<String>,
}

fn guardrail_error(executed: &ExecutedGuardrail) -> EngineError {
    EngineError::Guardrail {
        key: executed.key.clone(),
        stage: executed.stage.as_str().to_string(),
        info: executed.result.info.clone(),
    }
}

fn guardrail_frame(executed: &ExecutedGuardrail) -> GuardrailOutcome {
    GuardrailOutcome {
        guardrail_key: executed.key.clone(),
        guardrail_stage: executed.stage.as_str().to_string(),
        guardrail_tripwire_triggered: executed.result.tripwire_triggered,
        guardrail_suppressed: executed.suppressed,
        guardrail_token_usage: executed.result.token_usage,
        info: executed.result.info.clone(),
    }
}

fn request_metadata(req: &ChatRequest) -> Value {
    let mut metadata = serde_json::Map::new();
    if let Some(workflow) = &req.workflow {
        if let Ok(value) = serde_json::to_value(workflow) {
            metadata.insert("workflow".to_string(), value);
        }
    }
    if let Some(location) = &req.location_hint {
        metadata.insert("location".to_string(), location.clone());
    }
    if metadata.is_empty() {
        Value::Null
    } else {
        Value::Object(metadata)
    }
}
