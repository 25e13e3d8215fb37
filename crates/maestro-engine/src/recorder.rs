//! Run finalization: messages, run-item projection, usage attribution,
//! and session-state sync after a completed (or failed) turn.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use maestro_core::types::{ActorContext, ConversationId};
use maestro_protocol::frames::MessageAttachment;
use maestro_providers::{RunItem, TokenUsage};
use maestro_sessions::SessionManager;
use maestro_store::types::{MessageRole, NewMessage, RunUsage};
use maestro_store::Store;

use crate::processor::project_run_item;
use crate::error::Result;

pub struct RunRecord<'a> {
    pub actor: ActorContext,
    pub conversation_id: ConversationId,
    pub agent_key: &'a str,
    pub model: &'a str,
    pub provider_name: &'a str,
    pub response_id: Option<&'a str>,
    pub user_message: &'a str,
    pub user_attachments: &'a [MessageAttachment],
    pub assistant_text: &'a str,
    pub assistant_attachments: &'a [MessageAttachment],
    pub run_items: &'a [RunItem],
    pub usage: TokenUsage,
    pub workflow_run_id: Option<&'a str>,
    pub session_id: &'a str,
    pub provider_conversation_id: Option<&'a str>,
}

/// Persist everything a completed turn owes the ledger of record. Each
/// step is individually idempotent; re-finalizing the same response does
/// not duplicate rows or double-count usage.
pub fn finalize(store: &Arc<Store>, sessions: &SessionManager, record: &RunRecord<'_>) -> Result<()> {
    let attachments_json = |attachments: &[MessageAttachment]| {
        if attachments.is_empty() {
            None
        } else {
            serde_json::to_value(attachments).ok()
        }
    };

    store.append_messages(
        record.conversation_id,
        &[
            NewMessage {
                role: MessageRole::User,
                content: record.user_message.to_string(),
                attachments: attachments_json(record.user_attachments),
            },
            NewMessage {
                role: MessageRole::Assistant,
                content: record.assistant_text.to_string(),
                attachments: attachments_json(record.assistant_attachments),
            },
        ],
    )?;

    let rows: Vec<_> = record
        .run_items
        .iter()
        .map(|item| {
            project_run_item(
                item,
                record.agent_key,
                record.model,
                Some(record.assistant_attachments),
            )
        })
        .collect();
    store.record_run_items(record.conversation_id, &rows)?;

    let idempotency_key = record
        .response_id
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    store.record_run_usage(
        record.actor.tenant_id,
        Some(record.actor.user_id),
        &RunUsage {
            conversation_id: Some(record.conversation_id),
            response_id: record.response_id.unwrap_or_default().to_string(),
            run_id: record.workflow_run_id.map(String::from),
            agent_key: Some(record.agent_key.to_string()),
            provider: Some(record.provider_name.to_string()),
            requests: record.usage.requests,
            input_tokens: record.usage.input_tokens,
            output_tokens: record.usage.output_tokens,
            cached_input_tokens: record.usage.cached_input_tokens,
            reasoning_output_tokens: record.usage.reasoning_output_tokens,
        },
        &idempotency_key,
    )?;

    store.bump_conversation_counters(
        record.conversation_id,
        Some(record.agent_key),
        record.usage.input_tokens,
        record.usage.output_tokens,
    )?;

    if let Err(e) = sessions.sync_session_state(
        record.actor.tenant_id,
        record.conversation_id,
        record.session_id,
        record.provider_name,
        record.provider_conversation_id,
    ) {
        // the turn itself succeeded; a failed sync only costs session reuse
        warn!(error = %e, "session state sync failed");
    }

    info!(
        conversation_id = %record.conversation_id,
        agent = record.agent_key,
        tokens_in = record.usage.input_tokens,
        tokens_out = record.usage.output_tokens,
        "run finalized"
    );
    Ok(())
}
