use maestro_core::types::ConversationId;
use rusqlite::params;
use uuid::Uuid;

use crate::db::{now, Store};
use crate::error::Result;
use crate::types::{LedgerEventRef, NewLedgerEvent};

impl Store {
    /// Append one ledger row. Idempotent on `(conversation_id, event_id)`:
    /// a duplicate insert is ignored and reported as false.
    pub fn insert_ledger_event(&self, event: &NewLedgerEvent) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let inserted = db.execute(
            "INSERT OR IGNORE INTO ledger_events
                (conversation_id, event_id, tenant_id, stream_id, workflow_run_id, kind,
                 payload_inline_json, payload_object_key, payload_size_bytes,
                 payload_sha256, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            params![
                event.conversation_id.to_string(),
                event.event_id as i64,
                event.tenant_id.to_string(),
                event.stream_id,
                event.workflow_run_id,
                event.kind,
                event.payload_inline_json,
                event.payload_object_key,
                event.payload_size_bytes as i64,
                event.payload_sha256,
                now(),
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Highest recorded event id for a conversation, if any.
    pub fn max_ledger_event_id(&self, conversation_id: ConversationId) -> Result<Option<u64>> {
        let db = self.db.lock().unwrap();
        let max: Option<i64> = db.query_row(
            "SELECT MAX(event_id) FROM ledger_events WHERE conversation_id = ?1",
            params![conversation_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(max.map(|v| v as u64))
    }

    /// Ordered page of ledger rows strictly after `after_event_id`.
    pub fn list_ledger_events(
        &self,
        conversation_id: ConversationId,
        after_event_id: Option<u64>,
        limit: usize,
        workflow_run_id: Option<&str>,
    ) -> Result<Vec<LedgerEventRef>> {
        let db = self.db.lock().unwrap();
        let mut sql = String::from(
            "SELECT conversation_id, event_id, stream_id, workflow_run_id, kind,
                    payload_inline_json, payload_object_key, payload_size_bytes,
                    payload_sha256, created_at
             FROM ledger_events
             WHERE conversation_id = ?1 AND event_id > ?2",
        );
        if workflow_run_id.is_some() {
            sql.push_str(" AND workflow_run_id = ?4");
        }
        sql.push_str(" ORDER BY event_id ASC LIMIT ?3");

        let after = after_event_id.map(|v| v as i64).unwrap_or(-1);
        let mut stmt = db.prepare(&sql)?;
        let rows = match workflow_run_id {
            Some(run) => stmt
                .query_map(
                    params![conversation_id.to_string(), after, limit as i64, run],
                    row_to_ref,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?,
            None => stmt
                .query_map(
                    params![conversation_id.to_string(), after, limit as i64],
                    row_to_ref,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?,
        };
        Ok(rows)
    }
}

fn row_to_ref(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerEventRef> {
    let conv: String = row.get(0)?;
    Ok(LedgerEventRef {
        conversation_id: ConversationId(Uuid::parse_str(&conv).unwrap_or_default()),
        event_id: row.get::<_, i64>(1)? as u64,
        stream_id: row.get(2)?,
        workflow_run_id: row.get(3)?,
        kind: row.get(4)?,
        payload_inline_json: row.get(5)?,
        payload_object_key: row.get(6)?,
        payload_size_bytes: row.get::<_, i64>(7)? as u64,
        payload_sha256: row.get(8)?,
        created_at: row.get(9)?,
    })
}
