use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

use maestro_core::config::SessionConfig;
use maestro_core::types::{ActorContext, ConversationId, TenantId};
use maestro_providers::{AgentProvider, MemoryStrategyConfig, MemoryStrategyMode, SessionHandle};
use maestro_store::types::ConversationSessionState;
use maestro_store::Store;

use crate::error::Result;
use crate::memory::{CompactionEvent, StrategySession, SummarySink};

/// Policy knobs for provider conversation and session binding.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionPolicy {
    pub disable_provider_conversation_creation: bool,
    pub force_provider_session_rebind: bool,
}

impl From<&SessionConfig> for SessionPolicy {
    fn from(config: &SessionConfig) -> Self {
        Self {
            disable_provider_conversation_creation: config.disable_provider_conversation_creation,
            force_provider_session_rebind: config.force_provider_session_rebind,
        }
    }
}

/// Coordinates provider conversation ids and SDK session handles.
pub struct SessionManager {
    store: Arc<Store>,
    policy: SessionPolicy,
}

impl SessionManager {
    pub fn new(store: Arc<Store>, policy: SessionPolicy) -> Self {
        Self { store, policy }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Reuse, mint, or skip the provider-side conversation id.
    ///
    /// Concurrent requests for the same conversation may both mint; the
    /// state upsert after the run makes the race idempotent — losers
    /// observe the winner on their next turn.
    pub async fn resolve_provider_conversation_id(
        &self,
        provider: &dyn AgentProvider,
        actor: &ActorContext,
        conversation_id: ConversationId,
        existing: Option<&ConversationSessionState>,
    ) -> Option<String> {
        let prefix = provider.conversation_id_prefix();
        if let Some(state) = existing {
            if let Some(existing_id) = &state.provider_conversation_id {
                if existing_id.starts_with(prefix) {
                    return Some(existing_id.clone());
                }
                warn!(
                    conversation_id = %conversation_id,
                    provider_conversation_id = %existing_id,
                    "ignoring provider conversation id with unexpected format"
                );
            }
        }

        if self.policy.disable_provider_conversation_creation {
            return None;
        }
        let factory = provider.conversation_factory()?;
        match factory
            .create(
                &actor.tenant_id.to_string(),
                &actor.user_id.to_string(),
                &conversation_id.to_string(),
            )
            .await
        {
            Ok(candidate) if candidate.starts_with(prefix) => Some(candidate),
            Ok(candidate) => {
                warn!(
                    candidate = %candidate,
                    "provider conversation id did not match expected format; ignoring"
                );
                None
            }
            Err(e) => {
                warn!(error = %e, "failed to create provider conversation; proceeding without one");
                None
            }
        }
    }

    /// Pick the session id, build the handle, and wrap it with the
    /// configured memory strategy.
    ///
    /// Session id preference: provider conversation id (when rebind is
    /// forced or no SDK session is stored) → stored SDK session id → the
    /// internal conversation id.
    pub async fn acquire_session(
        &self,
        provider: &dyn AgentProvider,
        tenant_id: TenantId,
        conversation_id: ConversationId,
        provider_conversation_id: Option<&str>,
        memory_strategy: Option<MemoryStrategyConfig>,
        agent_key: Option<&str>,
        compaction_tx: Option<mpsc::Sender<CompactionEvent>>,
    ) -> Result<(String, Arc<dyn SessionHandle>)> {
        let state = self.store.get_session_state(tenant_id, conversation_id)?;
        let stored_sdk_session = state.as_ref().and_then(|s| s.sdk_session_id.clone());

        let session_id = match provider_conversation_id {
            Some(conv)
                if self.policy.force_provider_session_rebind || stored_sdk_session.is_none() =>
            {
                conv.to_string()
            }
            _ => stored_sdk_session.unwrap_or_else(|| conversation_id.to_string()),
        };

        let mut handle = provider.session_store().build(&session_id);
        if let Some(config) = memory_strategy {
            if config.mode != MemoryStrategyMode::None {
                let on_summary: Option<Arc<dyn SummarySink>> =
                    if config.mode == MemoryStrategyMode::Summarize {
                        Some(Arc::new(StoreSummarySink {
                            store: Arc::clone(&self.store),
                            conversation_id,
                            agent_key: agent_key.map(String::from),
                            summary_model: config.summarizer_model.clone(),
                        }))
                    } else {
                        None
                    };
                info!(
                    conversation_id = %conversation_id,
                    strategy = ?config.mode,
                    "memory strategy applied"
                );
                handle = Arc::new(StrategySession::new(handle, config, on_summary, compaction_tx));
            }
        }
        Ok((session_id, handle))
    }

    /// Record the handles actually used. Runs unconditionally after every
    /// turn, success or failure.
    pub fn sync_session_state(
        &self,
        tenant_id: TenantId,
        conversation_id: ConversationId,
        session_id: &str,
        provider_name: &str,
        provider_conversation_id: Option<&str>,
    ) -> Result<()> {
        self.store.update_session_state(
            tenant_id,
            conversation_id,
            &ConversationSessionState {
                provider: Some(provider_name.to_string()),
                provider_conversation_id: provider_conversation_id.map(String::from),
                sdk_session_id: Some(session_id.to_string()),
                session_cursor: None,
                last_session_sync_at: Some(
                    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
                ),
            },
        )?;
        Ok(())
    }
}

/// Writes summaries into `conversation_summaries`.
struct StoreSummarySink {
    store: Arc<Store>,
    conversation_id: ConversationId,
    agent_key: Option<String>,
    summary_model: String,
}

#[async_trait]
impl SummarySink for StoreSummarySink {
    async fn persist(&self, summary_text: &str, summary_length_tokens: Option<u64>) {
        if let Err(e) = self.store.persist_summary(
            self.conversation_id,
            self.agent_key.as_deref(),
            summary_text,
            Some(&self.summary_model),
            "v1",
            summary_length_tokens,
        ) {
            warn!(error = %e, "failed to persist conversation summary");
        }
    }
}
