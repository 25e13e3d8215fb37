use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use maestro_core::types::{ConversationId, TenantId};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::db::{now, Store};
use crate::error::{Result, StoreError};
use crate::types::{Conversation, Message, NewMessage, NewRunItem, RunItemRow, Segment};

/// Keyset cursor for conversation listings.
#[derive(Debug, Serialize, Deserialize)]
struct ListCursor {
    updated_at: String,
    id: String,
}

/// Filters accepted by `list_conversations`.
#[derive(Debug, Default, Clone)]
pub struct ConversationFilter {
    pub agent_entrypoint: Option<String>,
    pub updated_after: Option<String>,
}

impl Store {
    /// Return the conversation for a derived id, creating it (and its first
    /// segment) when absent. Racing creators both land on the same row.
    pub fn get_or_create_conversation(
        &self,
        tenant_id: TenantId,
        id: ConversationId,
        conversation_key: &str,
        agent_entrypoint: Option<&str>,
    ) -> Result<Conversation> {
        {
            let db = self.db.lock().unwrap();
            let ts = now();
            db.execute(
                "INSERT OR IGNORE INTO conversations
                    (id, tenant_id, conversation_key, agent_entrypoint, status,
                     created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?5)",
                params![
                    id.to_string(),
                    tenant_id.to_string(),
                    conversation_key,
                    agent_entrypoint,
                    ts
                ],
            )?;
            db.execute(
                "INSERT OR IGNORE INTO conversation_segments
                    (id, conversation_id, segment_index, created_at)
                 SELECT ?1, ?2, 0, ?3
                 WHERE NOT EXISTS (
                     SELECT 1 FROM conversation_segments WHERE conversation_id = ?2
                 )",
                params![Uuid::now_v7().to_string(), id.to_string(), ts],
            )?;
        }
        self.get_conversation(tenant_id, id)?
            .ok_or_else(|| StoreError::not_found("conversation", id))
    }

    /// Tenant-scoped lookup. A mismatched tenant sees `None`, never the row.
    pub fn get_conversation(
        &self,
        tenant_id: TenantId,
        id: ConversationId,
    ) -> Result<Option<Conversation>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            &format!("{CONVERSATION_SELECT} WHERE id = ?1 AND tenant_id = ?2"),
            params![id.to_string(), tenant_id.to_string()],
            row_to_conversation,
        ) {
            Ok(c) => Ok(Some(c)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Keyset-paginated listing, newest first. The cursor encodes the last
    /// row's `(updated_at, id)`; pagination stays stable under new writes.
    pub fn list_conversations(
        &self,
        tenant_id: TenantId,
        limit: usize,
        cursor: Option<&str>,
        filter: &ConversationFilter,
    ) -> Result<(Vec<Conversation>, Option<String>)> {
        let after = cursor.map(decode_list_cursor).transpose()?;
        let db = self.db.lock().unwrap();

        let mut sql = format!("{CONVERSATION_SELECT} WHERE tenant_id = ?1");
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> =
            vec![Box::new(tenant_id.to_string())];
        if let Some(c) = &after {
            sql.push_str(&format!(
                " AND (updated_at < ?{n} OR (updated_at = ?{n} AND id < ?{m}))",
                n = args.len() + 1,
                m = args.len() + 2
            ));
            args.push(Box::new(c.updated_at.clone()));
            args.push(Box::new(c.id.clone()));
        }
        if let Some(agent) = &filter.agent_entrypoint {
            sql.push_str(&format!(" AND agent_entrypoint = ?{}", args.len() + 1));
            args.push(Box::new(agent.clone()));
        }
        if let Some(after_ts) = &filter.updated_after {
            sql.push_str(&format!(" AND updated_at > ?{}", args.len() + 1));
            args.push(Box::new(after_ts.clone()));
        }
        sql.push_str(&format!(
            " ORDER BY updated_at DESC, id DESC LIMIT ?{}",
            args.len() + 1
        ));
        args.push(Box::new((limit + 1) as i64));

        let mut stmt = db.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), row_to_conversation)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(paginate(rows, limit))
    }

    /// Prefix/substring search over conversation keys.
    pub fn search_conversations(
        &self,
        tenant_id: TenantId,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Conversation>> {
        let db = self.db.lock().unwrap();
        let pattern = format!("%{}%", query.replace('%', "\\%").replace('_', "\\_"));
        let mut stmt = db.prepare(&format!(
            "{CONVERSATION_SELECT}
             WHERE tenant_id = ?1 AND conversation_key LIKE ?2 ESCAPE '\\'
             ORDER BY updated_at DESC LIMIT ?3"
        ))?;
        let rows = stmt
            .query_map(
                params![tenant_id.to_string(), pattern, limit as i64],
                row_to_conversation,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// The single segment with `truncated_at IS NULL`.
    pub fn active_segment(&self, conversation_id: ConversationId) -> Result<Segment> {
        let db = self.db.lock().unwrap();
        query_active_segment(&db, conversation_id)
    }

    /// Truncate: close the active segment and open the next one, atomically.
    /// Prior messages stay on disk but drop out of user-facing history.
    pub fn truncate_conversation(
        &self,
        tenant_id: TenantId,
        conversation_id: ConversationId,
    ) -> Result<Segment> {
        // Tenant scoping first so cross-tenant callers get not-found.
        if self.get_conversation(tenant_id, conversation_id)?.is_none() {
            return Err(StoreError::not_found("conversation", conversation_id));
        }

        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let current = query_active_segment(&tx, conversation_id)?;
        let last_position: Option<u32> = tx
            .query_row(
                "SELECT MAX(position) FROM conversation_messages WHERE segment_id = ?1",
                params![current.id],
                |row| row.get(0),
            )
            .unwrap_or(None);
        let last_event_id: Option<u64> = tx
            .query_row(
                "SELECT MAX(event_id) FROM ledger_events WHERE conversation_id = ?1",
                params![conversation_id.to_string()],
                |row| row.get(0),
            )
            .unwrap_or(None);
        let ts = now();
        tx.execute(
            "UPDATE conversation_segments
             SET truncated_at = ?2,
                 visible_through_event_id = ?3,
                 visible_through_message_position = ?4
             WHERE id = ?1",
            params![current.id, ts, last_event_id, last_position],
        )?;
        let next = Segment {
            id: Uuid::now_v7().to_string(),
            conversation_id,
            segment_index: current.segment_index + 1,
            parent_segment_id: Some(current.id.clone()),
            visible_through_event_id: None,
            visible_through_message_position: None,
            truncated_at: None,
        };
        tx.execute(
            "INSERT INTO conversation_segments
                (id, conversation_id, segment_index, parent_segment_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                next.id,
                conversation_id.to_string(),
                next.segment_index,
                next.parent_segment_id,
                ts
            ],
        )?;
        tx.execute(
            "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
            params![conversation_id.to_string(), ts],
        )?;
        tx.commit()?;
        debug!(conversation_id = %conversation_id, segment_index = next.segment_index, "conversation truncated");
        Ok(next)
    }

    /// Append messages to the active segment with dense positions.
    pub fn append_messages(
        &self,
        conversation_id: ConversationId,
        messages: &[NewMessage],
    ) -> Result<Vec<Message>> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let segment = query_active_segment(&tx, conversation_id)?;
        let base: u32 = tx
            .query_row(
                "SELECT COALESCE(MAX(position) + 1, 0) FROM conversation_messages
                 WHERE segment_id = ?1",
                params![segment.id],
                |row| row.get(0),
            )
            .unwrap_or(0);

        let ts = now();
        let mut out = Vec::with_capacity(messages.len());
        for (i, msg) in messages.iter().enumerate() {
            let row = Message {
                id: Uuid::now_v7().to_string(),
                conversation_id,
                segment_id: segment.id.clone(),
                position: base + i as u32,
                role: msg.role.as_str().to_string(),
                content: msg.content.clone(),
                attachments: msg.attachments.clone(),
                created_at: ts.clone(),
            };
            let attachments_json = row
                .attachments
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            tx.execute(
                "INSERT INTO conversation_messages
                    (id, conversation_id, segment_id, position, role, content, attachments, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    row.id,
                    conversation_id.to_string(),
                    row.segment_id,
                    row.position,
                    row.role,
                    row.content,
                    attachments_json,
                    row.created_at,
                ],
            )?;
            out.push(row);
        }
        tx.execute(
            "UPDATE conversations
             SET message_count = message_count + ?2, updated_at = ?3
             WHERE id = ?1",
            params![conversation_id.to_string(), messages.len() as i64, ts],
        )?;
        tx.commit()?;
        Ok(out)
    }

    /// User-facing history: messages of the active segment, in order.
    pub fn list_messages(
        &self,
        tenant_id: TenantId,
        conversation_id: ConversationId,
    ) -> Result<Vec<Message>> {
        if self.get_conversation(tenant_id, conversation_id)?.is_none() {
            return Err(StoreError::not_found("conversation", conversation_id));
        }
        let db = self.db.lock().unwrap();
        let segment = query_active_segment(&db, conversation_id)?;
        let mut stmt = db.prepare(
            "SELECT id, conversation_id, segment_id, position, role, content, attachments, created_at
             FROM conversation_messages
             WHERE segment_id = ?1
             ORDER BY position ASC",
        )?;
        let rows = stmt
            .query_map(params![segment.id], row_to_message)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Project a response's run items into the audit log with dense,
    /// monotonically increasing sequence numbers. Re-projecting a response
    /// that is already recorded is a no-op.
    pub fn record_run_items(
        &self,
        conversation_id: ConversationId,
        items: &[NewRunItem],
    ) -> Result<u64> {
        if items.is_empty() {
            return Ok(0);
        }
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;

        if let Some(response_id) = items.iter().find_map(|i| i.response_id.as_deref()) {
            let exists: i64 = tx.query_row(
                "SELECT COUNT(*) FROM conversation_events
                 WHERE conversation_id = ?1 AND response_id = ?2",
                params![conversation_id.to_string(), response_id],
                |row| row.get(0),
            )?;
            if exists > 0 {
                debug!(conversation_id = %conversation_id, response_id, "run items already projected");
                return Ok(0);
            }
        }

        let mut seq: u64 = tx.query_row(
            "SELECT COALESCE(MAX(sequence_no) + 1, 0) FROM conversation_events
             WHERE conversation_id = ?1",
            params![conversation_id.to_string()],
            |row| row.get(0),
        )?;
        let ts = now();
        let mut inserted = 0u64;
        for item in items {
            let n = tx.execute(
                "INSERT OR IGNORE INTO conversation_events
                    (conversation_id, sequence_no, response_id, run_item_type, run_item_name,
                     role, agent, tool_call_id, tool_name, model, content_text, reasoning_text,
                     call_arguments, call_output, attachments, created_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)",
                params![
                    conversation_id.to_string(),
                    seq,
                    item.response_id.as_deref().unwrap_or(""),
                    item.run_item_type,
                    item.run_item_name.as_deref().unwrap_or(""),
                    item.role,
                    item.agent,
                    item.tool_call_id.as_deref().unwrap_or(""),
                    item.tool_name,
                    item.model,
                    item.content_text,
                    item.reasoning_text,
                    item.call_arguments
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    item.call_output
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    item.attachments
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    ts,
                ],
            )?;
            if n > 0 {
                seq += 1;
                inserted += 1;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Internal audit rows, in sequence order.
    pub fn list_run_events(
        &self,
        tenant_id: TenantId,
        conversation_id: ConversationId,
    ) -> Result<Vec<RunItemRow>> {
        if self.get_conversation(tenant_id, conversation_id)?.is_none() {
            return Err(StoreError::not_found("conversation", conversation_id));
        }
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT conversation_id, sequence_no, response_id, run_item_type, run_item_name,
                    role, agent, tool_call_id, tool_name, model, content_text, reasoning_text,
                    call_arguments, call_output, attachments, created_at
             FROM conversation_events
             WHERE conversation_id = ?1
             ORDER BY sequence_no ASC",
        )?;
        let rows = stmt
            .query_map(params![conversation_id.to_string()], row_to_run_item)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Bump per-conversation counters after a completed run.
    pub fn bump_conversation_counters(
        &self,
        conversation_id: ConversationId,
        active_agent: Option<&str>,
        tokens_in: u64,
        tokens_out: u64,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE conversations
             SET total_tokens_in = total_tokens_in + ?2,
                 total_tokens_out = total_tokens_out + ?3,
                 active_agent = COALESCE(?4, active_agent),
                 updated_at = ?5
             WHERE id = ?1",
            params![
                conversation_id.to_string(),
                tokens_in as i64,
                tokens_out as i64,
                active_agent,
                now()
            ],
        )?;
        Ok(())
    }
}

const CONVERSATION_SELECT: &str =
    "SELECT id, tenant_id, conversation_key, agent_entrypoint, active_agent, status,
            message_count, total_tokens_in, total_tokens_out, created_at, updated_at
     FROM conversations";

fn paginate(
    mut rows: Vec<Conversation>,
    limit: usize,
) -> (Vec<Conversation>, Option<String>) {
    let next = if rows.len() > limit {
        rows.truncate(limit);
        rows.last().map(|c| {
            encode_list_cursor(&ListCursor {
                updated_at: c.updated_at.clone(),
                id: c.id.to_string(),
            })
        })
    } else {
        None
    };
    (rows, next)
}

fn encode_list_cursor(cursor: &ListCursor) -> String {
    URL_SAFE_NO_PAD.encode(serde_json::to_vec(cursor).unwrap_or_default())
}

fn decode_list_cursor(raw: &str) -> Result<ListCursor> {
    let bytes = URL_SAFE_NO_PAD
        .decode(raw)
        .map_err(|_| StoreError::InvalidCursor)?;
    serde_json::from_slice(&bytes).map_err(|_| StoreError::InvalidCursor)
}

fn query_active_segment(
    conn: &rusqlite::Connection,
    conversation_id: ConversationId,
) -> Result<Segment> {
    conn.query_row(
        "SELECT id, conversation_id, segment_index, parent_segment_id,
                visible_through_event_id, visible_through_message_position, truncated_at
         FROM conversation_segments
         WHERE conversation_id = ?1 AND truncated_at IS NULL",
        params![conversation_id.to_string()],
        row_to_segment,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => {
            StoreError::Invariant(format!("conversation {conversation_id} has no active segment"))
        }
        other => other.into(),
    })
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let id: String = row.get(0)?;
    let tenant: String = row.get(1)?;
    Ok(Conversation {
        id: ConversationId(Uuid::parse_str(&id).unwrap_or_default()),
        tenant_id: TenantId(Uuid::parse_str(&tenant).unwrap_or_default()),
        conversation_key: row.get(2)?,
        agent_entrypoint: row.get(3)?,
        active_agent: row.get(4)?,
        status: row.get(5)?,
        message_count: row.get::<_, i64>(6)? as u64,
        total_tokens_in: row.get::<_, i64>(7)? as u64,
        total_tokens_out: row.get::<_, i64>(8)? as u64,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn row_to_segment(row: &rusqlite::Row<'_>) -> rusqlite::Result<Segment> {
    let conv: String = row.get(1)?;
    Ok(Segment {
        id: row.get(0)?,
        conversation_id: ConversationId(Uuid::parse_str(&conv).unwrap_or_default()),
        segment_index: row.get::<_, i64>(2)? as u32,
        parent_segment_id: row.get(3)?,
        visible_through_event_id: row.get::<_, Option<i64>>(4)?.map(|v| v as u64),
        visible_through_message_position: row.get::<_, Option<i64>>(5)?.map(|v| v as u32),
        truncated_at: row.get(6)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let conv: String = row.get(1)?;
    let attachments: Option<String> = row.get(6)?;
    Ok(Message {
        id: row.get(0)?,
        conversation_id: ConversationId(Uuid::parse_str(&conv).unwrap_or_default()),
        segment_id: row.get(2)?,
        position: row.get::<_, i64>(3)? as u32,
        role: row.get(4)?,
        content: row.get(5)?,
        attachments: attachments.and_then(|a| serde_json::from_str(&a).ok()),
        created_at: row.get(7)?,
    })
}

fn row_to_run_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunItemRow> {
    let conv: String = row.get(0)?;
    let args: Option<String> = row.get(12)?;
    let output: Option<String> = row.get(13)?;
    let attachments: Option<String> = row.get(14)?;
    Ok(RunItemRow {
        conversation_id: ConversationId(Uuid::parse_str(&conv).unwrap_or_default()),
        sequence_no: row.get::<_, i64>(1)? as u64,
        response_id: row.get(2)?,
        run_item_type: row.get(3)?,
        run_item_name: row.get(4)?,
        role: row.get(5)?,
        agent: row.get(6)?,
        tool_call_id: row.get(7)?,
        tool_name: row.get(8)?,
        model: row.get(9)?,
        content_text: row.get(10)?,
        reasoning_text: row.get(11)?,
        call_arguments: args.and_then(|a| serde_json::from_str(&a).ok()),
        call_output: output.and_then(|a| serde_json::from_str(&a).ok()),
        attachments: attachments.and_then(|a| serde_json::from_str(&a).ok()),
        created_at: row.get(15)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageRole;

    fn setup() -> (Store, TenantId, ConversationId) {
        let store = Store::open_in_memory().unwrap();
        let tenant = store.create_tenant("acme", "Acme").unwrap();
        let id = ConversationId::from_key("thread-1");
        store
            .get_or_create_conversation(tenant.id, id, "thread-1", Some("triage"))
            .unwrap();
        (store, tenant.id, id)
    }

    fn msg(role: MessageRole, content: &str) -> NewMessage {
        NewMessage {
            role,
            content: content.to_string(),
            attachments: None,
        }
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let (store, tenant, id) = setup();
        let again = store
            .get_or_create_conversation(tenant, id, "thread-1", Some("triage"))
            .unwrap();
        assert_eq!(again.id, id);
        assert_eq!(store.active_segment(id).unwrap().segment_index, 0);
    }

    #[test]
    fn cross_tenant_read_sees_nothing() {
        let (store, _tenant, id) = setup();
        let other = store.create_tenant("rival", "Rival").unwrap();
        assert!(store.get_conversation(other.id, id).unwrap().is_none());
        assert!(matches!(
            store.list_messages(other.id, id).unwrap_err(),
            StoreError::NotFound { .. }
        ));
    }

    #[test]
    fn message_positions_are_dense_per_segment() {
        let (store, tenant, id) = setup();
        store
            .append_messages(id, &[msg(MessageRole::User, "hi"), msg(MessageRole::Assistant, "hello")])
            .unwrap();
        let more = store
            .append_messages(id, &[msg(MessageRole::User, "again")])
            .unwrap();
        assert_eq!(more[0].position, 2);

        let history = store.list_messages(tenant, id).unwrap();
        let positions: Vec<u32> = history.iter().map(|m| m.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);
    }

    #[test]
    fn truncation_opens_a_fresh_segment_atomically() {
        let (store, tenant, id) = setup();
        store
            .append_messages(id, &[msg(MessageRole::User, "hi"), msg(MessageRole::Assistant, "hello")])
            .unwrap();
        let next = store.truncate_conversation(tenant, id).unwrap();
        assert_eq!(next.segment_index, 1);
        assert!(next.truncated_at.is_none());

        // history resets; new messages start at position 0 again
        assert!(store.list_messages(tenant, id).unwrap().is_empty());
        let fresh = store
            .append_messages(id, &[msg(MessageRole::User, "new era")])
            .unwrap();
        assert_eq!(fresh[0].position, 0);

        // exactly one active segment survives
        assert_eq!(store.active_segment(id).unwrap().id, next.id);
    }

    #[test]
    fn run_item_projection_is_idempotent() {
        let (store, tenant, id) = setup();
        let items = vec![
            NewRunItem {
                response_id: Some("resp_1".into()),
                run_item_type: "message".into(),
                content_text: Some("hello".into()),
                ..Default::default()
            },
            NewRunItem {
                response_id: Some("resp_1".into()),
                run_item_type: "tool_call".into(),
                tool_call_id: Some("call_1".into()),
                tool_name: Some("lookup".into()),
                ..Default::default()
            },
        ];
        assert_eq!(store.record_run_items(id, &items).unwrap(), 2);
        assert_eq!(store.record_run_items(id, &items).unwrap(), 0);

        let rows = store.list_run_events(tenant, id).unwrap();
        let seqs: Vec<u64> = rows.iter().map(|r| r.sequence_no).collect();
        assert_eq!(seqs, vec![0, 1]);
    }

    #[test]
    fn list_pagination_terminates() {
        let (store, tenant, _id) = setup();
        for i in 0..5 {
            let key = format!("bulk-{i}");
            store
                .get_or_create_conversation(tenant, ConversationId::from_key(&key), &key, None)
                .unwrap();
        }
        let mut seen = 0;
        let mut cursor: Option<String> = None;
        loop {
            let (page, next) = store
                .list_conversations(tenant, 2, cursor.as_deref(), &ConversationFilter::default())
                .unwrap();
            seen += page.len();
            match next {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }
        assert_eq!(seen, 6); // 5 bulk + the setup conversation
    }

    #[test]
    fn search_matches_key_substring() {
        let (store, tenant, _id) = setup();
        let hits = store.search_conversations(tenant, "read", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].conversation_key, "thread-1");
    }
}
