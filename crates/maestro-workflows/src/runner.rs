//! Workflow execution: stages of steps over the agent engine, with step
//! recording, cancellation, and workflow-tagged streaming.

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::join_all;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use maestro_core::types::{ActorContext, ConversationId, WorkflowRunId};
use maestro_engine::{ChatOutcome, ChatRequest, EngineError, ExecutionEngine};
use maestro_ledger::LedgerWriter;
use maestro_protocol::frames::{new_stream_id, FrameEnvelope, StreamFrame, WorkflowMeta};
use maestro_providers::TokenUsage;
use maestro_store::types::{WorkflowRun, WorkflowRunStatus, WorkflowStepRow};
use maestro_store::Store;
use uuid::Uuid;

use crate::callables::StepRecord;
use crate::error::{Result, WorkflowError};
use crate::registry::WorkflowRegistry;
use crate::spec::{StageMode, StageSpec, StepSpec, WorkflowDescriptor, WorkflowSpec};

pub struct WorkflowRunRequest {
    pub actor: ActorContext,
    pub message: String,
    pub conversation_key: Option<String>,
    /// Cancelled by the caller (explicit cancel or client disconnect).
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct WorkflowRunOutcome {
    pub run_id: WorkflowRunId,
    pub conversation_id: ConversationId,
    pub status: WorkflowRunStatus,
    pub final_output_text: Option<String>,
    pub final_output_structured: Option<Value>,
    pub usage: TokenUsage,
}

struct StreamSink {
    tx: mpsc::Sender<StreamFrame>,
    stream_id: String,
}

pub struct WorkflowService {
    registry: Arc<WorkflowRegistry>,
    engine: Arc<ExecutionEngine>,
    store: Arc<Store>,
    ledger: Arc<LedgerWriter>,
    /// In-flight runs on this node; cancel flips the token.
    active_runs: DashMap<String, CancellationToken>,
}

impl WorkflowService {
    pub fn new(
        registry: Arc<WorkflowRegistry>,
        engine: Arc<ExecutionEngine>,
        store: Arc<Store>,
        ledger: Arc<LedgerWriter>,
    ) -> Self {
        Self {
            registry,
            engine,
            store,
            ledger,
            active_runs: DashMap::new(),
        }
    }

    pub fn list(&self) -> Vec<WorkflowDescriptor> {
        self.registry.list_descriptors()
    }

    pub fn get_run(
        &self,
        tenant_id: maestro_core::types::TenantId,
        run_id: WorkflowRunId,
    ) -> Result<(WorkflowRun, Vec<WorkflowStepRow>)> {
        let run = self
            .store
            .get_workflow_run(tenant_id, run_id)?
            .ok_or_else(|| WorkflowError::UnknownRun {
                id: run_id.to_string(),
            })?;
        let steps = self.store.list_workflow_steps(run_id)?;
        Ok((run, steps))
    }

    /// Signal cancellation. Terminal runs are a no-op (false); a running
    /// run is either cancelled in-flight on this node or marked directly.
    pub fn cancel(
        &self,
        tenant_id: maestro_core::types::TenantId,
        run_id: WorkflowRunId,
    ) -> Result<bool> {
        let run = self
            .store
            .get_workflow_run(tenant_id, run_id)?
            .ok_or_else(|| WorkflowError::UnknownRun {
                id: run_id.to_string(),
            })?;
        if run.status.is_terminal() {
            return Ok(false);
        }
        if let Some(token) = self.active_runs.get(&run_id.to_string()) {
            token.cancel();
            return Ok(true);
        }
        self.store
            .finish_workflow_run(run_id, WorkflowRunStatus::Cancelled, None, None)?;
        Ok(true)
    }

    pub async fn run(&self, key: &str, req: WorkflowRunRequest) -> Result<WorkflowRunOutcome> {
        self.execute(key, req, None).await
    }

    pub async fn run_stream(
        &self,
        key: &str,
        req: WorkflowRunRequest,
        tx: mpsc::Sender<StreamFrame>,
    ) -> Result<WorkflowRunOutcome> {
        let sink = StreamSink {
            tx,
            stream_id: new_stream_id(),
        };
        self.execute(key, req, Some(sink)).await
    }

    async fn execute(
        &self,
        key: &str,
        req: WorkflowRunRequest,
        sink: Option<StreamSink>,
    ) -> Result<WorkflowRunOutcome> {
        let spec = self
            .registry
            .get(key)
            .ok_or_else(|| WorkflowError::UnknownWorkflow {
                key: key.to_string(),
            })?
            .clone();

        let conversation_key = req
            .conversation_key
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let conversation_id = ConversationId::from_key(&conversation_key);
        self.store.get_or_create_conversation(
            req.actor.tenant_id,
            conversation_id,
            &conversation_key,
            Some(&spec.key),
        )?;

        let run_id = WorkflowRunId::new();
        self.store.create_workflow_run(
            run_id,
            req.actor.tenant_id,
            req.actor.user_id,
            &spec.key,
            conversation_id,
            &req.message,
            spec.output_schema.as_ref(),
        )?;
        let cancel = req.cancel.clone();
        self.active_runs.insert(run_id.to_string(), cancel.clone());

        let result = self
            .execute_inner(&spec, &req, conversation_id, &conversation_key, run_id, &cancel, sink.as_ref())
            .await;

        self.active_runs.remove(&run_id.to_string());
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_inner(
        &self,
        spec: &WorkflowSpec,
        req: &WorkflowRunRequest,
        conversation_id: ConversationId,
        conversation_key: &str,
        run_id: WorkflowRunId,
        cancel: &CancellationToken,
        sink: Option<&StreamSink>,
    ) -> Result<WorkflowRunOutcome> {
        let env = self.envelope(conversation_id, spec, run_id, sink);
        self.emit(&env, req, conversation_id, run_id, sink, |e, id| {
            e.lifecycle(id, "workflow_started", json!({"status": "in_progress"}))
        })
        .await?;

        let mut current_input = req.message.clone();
        let mut prior: Vec<StepRecord> = Vec::new();
        let mut sequence_no: u32 = 0;
        let mut total_usage = TokenUsage::default();
        let mut last_structured: Option<Value> = None;

        for stage in &spec.stages {
            if cancel.is_cancelled() {
                return self
                    .finish_cancelled(&env, req, conversation_id, run_id, sink)
                    .await;
            }
            let stage_result = match stage.mode {
                StageMode::Sequential => {
                    self.run_sequential_stage(
                        spec,
                        stage,
                        req,
                        conversation_key,
                        run_id,
                        cancel,
                        sink,
                        &mut current_input,
                        &mut prior,
                        &mut sequence_no,
                        &mut total_usage,
                        &mut last_structured,
                    )
                    .await
                }
                StageMode::Parallel => {
                    self.run_parallel_stage(
                        spec,
                        stage,
                        req,
                        conversation_key,
                        run_id,
                        cancel,
                        sink,
                        &mut current_input,
                        &mut prior,
                        &mut sequence_no,
                        &mut total_usage,
                        &mut last_structured,
                    )
                    .await
                }
            };
            match stage_result {
                Ok(()) => {}
                Err(WorkflowError::Engine(EngineError::Cancelled)) => {
                    return self
                        .finish_cancelled(&env, req, conversation_id, run_id, sink)
                        .await;
                }
                Err(e) => {
                    self.store
                        .finish_workflow_run(run_id, WorkflowRunStatus::Failed, None, None)?;
                    if let Some(_sink) = sink {
                        let code = e.kind().code();
                        let message = e.to_string();
                        if let Err(emit_err) = self
                            .emit(&env, req, conversation_id, run_id, sink, |env, id| {
                                env.error_frame(id, code, message.clone())
                            })
                            .await
                        {
                            warn!(error = %emit_err, "failed to emit workflow error frame");
                        }
                    }
                    return Err(e);
                }
            }
        }

        let final_structured = last_structured.or_else(|| {
            spec.output_schema
                .as_ref()
                .map(|_| json!({"output": current_input}))
        });
        self.store.finish_workflow_run(
            run_id,
            WorkflowRunStatus::Succeeded,
            Some(&current_input),
            final_structured.as_ref(),
        )?;

        self.emit(&env, req, conversation_id, run_id, sink, |env, id| {
            env.final_frame(
                id,
                Some(current_input.clone()),
                final_structured.clone(),
                None,
            )
        })
        .await?;

        info!(
            workflow = %spec.key,
            run_id = %run_id,
            conversation_id = %conversation_id,
            steps = sequence_no,
            "workflow run succeeded"
        );
        Ok(WorkflowRunOutcome {
            run_id,
            conversation_id,
            status: WorkflowRunStatus::Succeeded,
            final_output_text: Some(current_input),
            final_output_structured: final_structured,
            usage: total_usage,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_sequential_stage(
        &self,
        spec: &WorkflowSpec,
        stage: &StageSpec,
        req: &WorkflowRunRequest,
        conversation_key: &str,
        run_id: WorkflowRunId,
        cancel: &CancellationToken,
        sink: Option<&StreamSink>,
        current_input: &mut String,
        prior: &mut Vec<StepRecord>,
        sequence_no: &mut u32,
        total_usage: &mut TokenUsage,
        last_structured: &mut Option<Value>,
    ) -> Result<()> {
        for step in &stage.steps {
            if cancel.is_cancelled() {
                return Err(WorkflowError::Engine(EngineError::Cancelled));
            }
            let Some(step_input) = self.step_input(step, current_input, prior) else {
                self.record_step(run_id, *sequence_no, stage, step, None, None, "skipped")?;
                *sequence_no += 1;
                continue;
            };
            let meta = step_meta(spec, run_id, stage, step, None, None);
            let outcome = self
                .invoke_engine(req, conversation_key, step, meta, cancel, sink, step_input)
                .await?;

            self.record_step(
                run_id,
                *sequence_no,
                stage,
                step,
                Some(&outcome),
                None,
                "succeeded",
            )?;
            *sequence_no += 1;
            total_usage.add(&outcome.usage);
            *last_structured = outcome.structured_output.clone();
            prior.push(StepRecord {
                step_name: step.display_name().to_string(),
                agent_key: step.agent_key.clone(),
                output: outcome.response_text.clone(),
            });
            *current_input = outcome.response_text;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_parallel_stage(
        &self,
        spec: &WorkflowSpec,
        stage: &StageSpec,
        req: &WorkflowRunRequest,
        conversation_key: &str,
        run_id: WorkflowRunId,
        cancel: &CancellationToken,
        sink: Option<&StreamSink>,
        current_input: &mut String,
        prior: &mut Vec<StepRecord>,
        sequence_no: &mut u32,
        total_usage: &mut TokenUsage,
        last_structured: &mut Option<Value>,
    ) -> Result<()> {
        // compute every branch's input first; skipped branches stay home
        let mut branches: Vec<(u32, &StepSpec, Option<String>)> = Vec::new();
        for (i, step) in stage.steps.iter().enumerate() {
            branches.push((i as u32, step, self.step_input(step, current_input, prior)));
        }

        let futures: Vec<_> = branches
            .iter()
            .filter_map(|(i, step, input)| {
                input.as_ref().map(|input| {
                    let meta = step_meta(spec, run_id, stage, step, Some(stage.name.clone()), Some(*i));
                    self.invoke_engine(req, conversation_key, step, meta, cancel, sink, input.clone())
                })
            })
            .collect();
        let mut results = join_all(futures).await.into_iter();

        // record in branch-index order regardless of completion order
        let mut outputs: Vec<String> = Vec::new();
        for (i, step, input) in &branches {
            match input {
                None => {
                    self.record_step(run_id, *sequence_no, stage, step, None, Some(*i), "skipped")?;
                    *sequence_no += 1;
                }
                Some(_) => {
                    let outcome = results
                        .next()
                        .ok_or_else(|| WorkflowError::Validation("branch result missing".into()))??;
                    self.record_step(
                        run_id,
                        *sequence_no,
                        stage,
                        step,
                        Some(&outcome),
                        Some(*i),
                        "succeeded",
                    )?;
                    *sequence_no += 1;
                    total_usage.add(&outcome.usage);
                    *last_structured = outcome.structured_output.clone();
                    prior.push(StepRecord {
                        step_name: step.display_name().to_string(),
                        agent_key: step.agent_key.clone(),
                        output: outcome.response_text.clone(),
                    });
                    outputs.push(outcome.response_text);
                }
            }
        }

        *current_input = match (&stage.reducer, outputs.len()) {
            (_, 0) => current_input.clone(),
            (None, 1) => outputs.remove(0),
            (None, _) => outputs.join("\n\n"),
            (Some(reducer), _) => {
                let f = self
                    .registry
                    .callables()
                    .reducer(reducer)
                    .ok_or_else(|| WorkflowError::Validation(format!("unknown reducer '{reducer}'")))?;
                f(&outputs, prior)
            }
        };
        Ok(())
    }

    /// Guard + mapper for one step. `None` means the guard skipped it.
    fn step_input(
        &self,
        step: &StepSpec,
        current_input: &str,
        prior: &[StepRecord],
    ) -> Option<String> {
        if let Some(guard) = &step.guard {
            if let Some(f) = self.registry.callables().guard(guard) {
                if !f(current_input, prior) {
                    return None;
                }
            }
        }
        let input = match &step.input_mapper {
            Some(mapper) => self
                .registry
                .callables()
                .mapper(mapper)
                .map(|f| f(current_input, prior))
                .unwrap_or_else(|| current_input.to_string()),
            None => current_input.to_string(),
        };
        Some(input)
    }

    async fn invoke_engine(
        &self,
        req: &WorkflowRunRequest,
        conversation_key: &str,
        step: &StepSpec,
        meta: WorkflowMeta,
        cancel: &CancellationToken,
        sink: Option<&StreamSink>,
        input: String,
    ) -> Result<ChatOutcome> {
        let mut chat = ChatRequest::new(req.actor, input);
        chat.agent_key = Some(step.agent_key.clone());
        chat.conversation_key = Some(conversation_key.to_string());
        chat.workflow = Some(meta);
        chat.cancel = cancel.child_token();
        chat.emit_terminal = false;
        let outcome = match sink {
            Some(sink) => {
                chat.stream_id = Some(sink.stream_id.clone());
                self.engine.run_stream(chat, sink.tx.clone()).await?
            }
            None => self.engine.run(chat).await?,
        };
        Ok(outcome)
    }

    fn record_step(
        &self,
        run_id: WorkflowRunId,
        sequence_no: u32,
        stage: &StageSpec,
        step: &StepSpec,
        outcome: Option<&ChatOutcome>,
        branch_index: Option<u32>,
        status: &str,
    ) -> Result<()> {
        self.store.record_workflow_step(&WorkflowStepRow {
            run_id: run_id.to_string(),
            sequence_no,
            step_name: step.display_name().to_string(),
            agent_key: step.agent_key.clone(),
            stage_name: stage.name.clone(),
            parallel_group: (stage.mode == StageMode::Parallel).then(|| stage.name.clone()),
            branch_index,
            response_id: outcome.and_then(|o| o.response_id.clone()),
            response_text: outcome.map(|o| o.response_text.clone()),
            structured_output: outcome.and_then(|o| o.structured_output.clone()),
            output_schema: step.output_schema.clone(),
            status: status.to_string(),
        })?;
        Ok(())
    }

    async fn finish_cancelled(
        &self,
        env: &FrameEnvelope,
        req: &WorkflowRunRequest,
        conversation_id: ConversationId,
        run_id: WorkflowRunId,
        sink: Option<&StreamSink>,
    ) -> Result<WorkflowRunOutcome> {
        self.store
            .finish_workflow_run(run_id, WorkflowRunStatus::Cancelled, None, None)?;
        if sink.is_some() {
            if let Err(e) = self
                .emit(env, req, conversation_id, run_id, sink, |env, id| {
                    env.error_frame(id, "cancelled", "workflow run cancelled")
                })
                .await
            {
                warn!(error = %e, "failed to emit cancellation frame");
            }
        }
        info!(run_id = %run_id, "workflow run cancelled");
        Ok(WorkflowRunOutcome {
            run_id,
            conversation_id,
            status: WorkflowRunStatus::Cancelled,
            final_output_text: None,
            final_output_structured: None,
            usage: TokenUsage::default(),
        })
    }

    fn envelope(
        &self,
        conversation_id: ConversationId,
        spec: &WorkflowSpec,
        run_id: WorkflowRunId,
        sink: Option<&StreamSink>,
    ) -> FrameEnvelope {
        let mut env = FrameEnvelope::new(conversation_id.to_string()).with_workflow(WorkflowMeta {
            workflow_key: spec.key.clone(),
            workflow_run_id: run_id.to_string(),
            step_name: None,
            step_agent: None,
            stage_name: None,
            parallel_group: None,
            branch_index: None,
        });
        if let Some(sink) = sink {
            env.stream_id = sink.stream_id.clone();
        }
        env
    }

    /// Record and deliver a runner-owned frame (no-op without a sink).
    async fn emit<F>(
        &self,
        env: &FrameEnvelope,
        req: &WorkflowRunRequest,
        conversation_id: ConversationId,
        run_id: WorkflowRunId,
        sink: Option<&StreamSink>,
        build: F,
    ) -> Result<()>
    where
        F: FnOnce(&FrameEnvelope, u64) -> StreamFrame,
    {
        let Some(sink) = sink else {
            return Ok(());
        };
        let run = run_id.to_string();
        let frame = self
            .ledger
            .record(req.actor.tenant_id, conversation_id, Some(&run), |id| {
                build(env, id)
            })
            .await?;
        let _ = sink.tx.send(frame).await;
        Ok(())
    }
}

fn step_meta(
    spec: &WorkflowSpec,
    run_id: WorkflowRunId,
    stage: &StageSpec,
    step: &StepSpec,
    parallel_group: Option<String>,
    branch_index: Option<u32>,
) -> WorkflowMeta {
    WorkflowMeta {
        workflow_key: spec.key.clone(),
        workflow_run_id: run_id.to_string(),
        step_name: Some(step.display_name().to_string()),
        step_agent: Some(step.agent_key.clone()),
        stage_name: Some(stage.name.clone()),
        parallel_group,
        branch_index,
    }
}
