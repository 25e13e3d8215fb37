use maestro_core::types::{ConversationId, TenantId};
use rusqlite::params;
use uuid::Uuid;

use crate::db::{now, Store};
use crate::error::Result;
use crate::types::ConversationSessionState;

impl Store {
    /// Session lifecycle state for a conversation, tenant-scoped.
    pub fn get_session_state(
        &self,
        tenant_id: TenantId,
        conversation_id: ConversationId,
    ) -> Result<Option<ConversationSessionState>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT provider, provider_conversation_id, sdk_session_id,
                    session_cursor, last_session_sync_at
             FROM conversation_sessions
             WHERE conversation_id = ?1 AND tenant_id = ?2",
            params![conversation_id.to_string(), tenant_id.to_string()],
            |row| {
                Ok(ConversationSessionState {
                    provider: row.get(0)?,
                    provider_conversation_id: row.get(1)?,
                    sdk_session_id: row.get(2)?,
                    session_cursor: row.get(3)?,
                    last_session_sync_at: row.get(4)?,
                })
            },
        ) {
            Ok(s) => Ok(Some(s)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Upsert the session state after a run. Called unconditionally so the
    /// stored mapping always reflects the handles actually used.
    pub fn update_session_state(
        &self,
        tenant_id: TenantId,
        conversation_id: ConversationId,
        state: &ConversationSessionState,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO conversation_sessions
                (conversation_id, tenant_id, provider, provider_conversation_id,
                 sdk_session_id, session_cursor, last_session_sync_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (conversation_id) DO UPDATE SET
                 provider = excluded.provider,
                 provider_conversation_id = excluded.provider_conversation_id,
                 sdk_session_id = excluded.sdk_session_id,
                 session_cursor = excluded.session_cursor,
                 last_session_sync_at = excluded.last_session_sync_at",
            params![
                conversation_id.to_string(),
                tenant_id.to_string(),
                state.provider,
                state.provider_conversation_id,
                state.sdk_session_id,
                state.session_cursor,
                state.last_session_sync_at,
            ],
        )?;
        Ok(())
    }

    /// Persist one memory-compaction summary.
    pub fn persist_summary(
        &self,
        conversation_id: ConversationId,
        agent_key: Option<&str>,
        summary_text: &str,
        summary_model: Option<&str>,
        version: &str,
        summary_length_tokens: Option<u64>,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO conversation_summaries
                (id, conversation_id, agent_key, summary_text, summary_model,
                 version, summary_length_tokens, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                Uuid::now_v7().to_string(),
                conversation_id.to_string(),
                agent_key,
                summary_text,
                summary_model,
                version,
                summary_length_tokens.map(|v| v as i64),
                now(),
            ],
        )?;
        Ok(())
    }

    /// Count of persisted summaries (used by tests and the history API).
    pub fn count_summaries(&self, conversation_id: ConversationId) -> Result<u64> {
        let db = self.db.lock().unwrap();
        let n: i64 = db.query_row(
            "SELECT COUNT(*) FROM conversation_summaries WHERE conversation_id = ?1",
            params![conversation_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_state_round_trips() {
        let store = Store::open_in_memory().unwrap();
        let tenant = store.create_tenant("acme", "Acme").unwrap();
        let conv = ConversationId::from_key("thread-1");
        store
            .get_or_create_conversation(tenant.id, conv, "thread-1", None)
            .unwrap();

        assert!(store.get_session_state(tenant.id, conv).unwrap().is_none());

        let state = ConversationSessionState {
            provider: Some("mock".into()),
            provider_conversation_id: Some("conv_abc".into()),
            sdk_session_id: Some("sess-1".into()),
            session_cursor: None,
            last_session_sync_at: Some(now()),
        };
        store.update_session_state(tenant.id, conv, &state).unwrap();
        let loaded = store.get_session_state(tenant.id, conv).unwrap().unwrap();
        assert_eq!(loaded.provider_conversation_id.as_deref(), Some("conv_abc"));

        // cross-tenant read is scoped away
        let other = store.create_tenant("rival", "Rival").unwrap();
        assert!(store.get_session_state(other.id, conv).unwrap().is_none());
    }
}
