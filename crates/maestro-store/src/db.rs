use std::sync::Mutex;

use rusqlite::Connection;

use crate::error::Result;

/// Relational store for tenancy, conversations, the event ledger index,
/// workflow runs, and usage accounting.
///
/// Wraps a single SQLite connection in a `Mutex`. SQLite serializes
/// writers, which is exactly the isolation the segment-truncation and
/// ledger-append transactions rely on; readers share the same lock, which
/// is sufficient for the single-node target.
pub struct Store {
    pub(crate) db: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database file and run schema bootstrap.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// In-memory store for tests and the `memory` dev profile.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }
}

/// Create every table and index. Safe to call on every startup — uses
/// `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS tenants (
            id                TEXT PRIMARY KEY,
            slug              TEXT NOT NULL UNIQUE,
            name              TEXT NOT NULL,
            status            TEXT NOT NULL DEFAULT 'active',
            status_updated_at TEXT NOT NULL,
            status_reason     TEXT,
            created_at        TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS users (
            id                TEXT PRIMARY KEY,
            email             TEXT NOT NULL UNIQUE,
            status            TEXT NOT NULL DEFAULT 'active',
            email_verified_at TEXT,
            created_at        TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tenant_memberships (
            user_id    TEXT NOT NULL REFERENCES users(id),
            tenant_id  TEXT NOT NULL REFERENCES tenants(id),
            role       TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (user_id, tenant_id)
        );

        CREATE TABLE IF NOT EXISTS conversations (
            id               TEXT PRIMARY KEY,
            tenant_id        TEXT NOT NULL REFERENCES tenants(id),
            conversation_key TEXT NOT NULL,
            agent_entrypoint TEXT,
            active_agent     TEXT,
            status           TEXT NOT NULL DEFAULT 'active',
            message_count    INTEGER NOT NULL DEFAULT 0,
            total_tokens_in  INTEGER NOT NULL DEFAULT 0,
            total_tokens_out INTEGER NOT NULL DEFAULT 0,
            created_at       TEXT NOT NULL,
            updated_at       TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_conversations_tenant
            ON conversations(tenant_id, updated_at DESC);
        CREATE INDEX IF NOT EXISTS idx_conversations_key
            ON conversations(tenant_id, conversation_key);

        CREATE TABLE IF NOT EXISTS conversation_segments (
            id                TEXT PRIMARY KEY,
            conversation_id   TEXT NOT NULL REFERENCES conversations(id),
            segment_index     INTEGER NOT NULL,
            parent_segment_id TEXT,
            visible_through_event_id         INTEGER,
            visible_through_message_position INTEGER,
            truncated_at      TEXT,
            created_at        TEXT NOT NULL,
            UNIQUE (conversation_id, segment_index)
        );
        CREATE INDEX IF NOT EXISTS idx_segments_active
            ON conversation_segments(conversation_id)
            WHERE truncated_at IS NULL;

        CREATE TABLE IF NOT EXISTS conversation_messages (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            segment_id      TEXT NOT NULL REFERENCES conversation_segments(id),
            position        INTEGER NOT NULL,
            role            TEXT NOT NULL,
            content         TEXT NOT NULL,
            attachments     TEXT,
            created_at      TEXT NOT NULL,
            UNIQUE (conversation_id, segment_id, position)
        );

        CREATE TABLE IF NOT EXISTS conversation_events (
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            sequence_no     INTEGER NOT NULL,
            response_id     TEXT NOT NULL DEFAULT '',
            run_item_type   TEXT NOT NULL,
            run_item_name   TEXT NOT NULL DEFAULT '',
            role            TEXT,
            agent           TEXT,
            tool_call_id    TEXT NOT NULL DEFAULT '',
            tool_name       TEXT,
            model           TEXT,
            content_text    TEXT,
            reasoning_text  TEXT,
            call_arguments  TEXT,
            call_output     TEXT,
            attachments     TEXT,
            created_at      TEXT NOT NULL,
            UNIQUE (conversation_id, response_id, sequence_no, tool_call_id, run_item_name)
        );
        CREATE INDEX IF NOT EXISTS idx_conversation_events_seq
            ON conversation_events(conversation_id, sequence_no);

        CREATE TABLE IF NOT EXISTS ledger_events (
            conversation_id    TEXT NOT NULL REFERENCES conversations(id),
            event_id           INTEGER NOT NULL,
            tenant_id          TEXT NOT NULL,
            stream_id          TEXT NOT NULL,
            workflow_run_id    TEXT,
            kind               TEXT NOT NULL,
            payload_inline_json TEXT,
            payload_object_key  TEXT,
            payload_size_bytes  INTEGER NOT NULL,
            payload_sha256      TEXT,
            created_at          TEXT NOT NULL,
            PRIMARY KEY (conversation_id, event_id),
            CHECK ((payload_inline_json IS NULL) <> (payload_object_key IS NULL))
        );
        CREATE INDEX IF NOT EXISTS idx_ledger_events_run
            ON ledger_events(workflow_run_id, conversation_id, event_id)
            WHERE workflow_run_id IS NOT NULL;

        CREATE TABLE IF NOT EXISTS conversation_sessions (
            conversation_id          TEXT PRIMARY KEY REFERENCES conversations(id),
            tenant_id                TEXT NOT NULL,
            provider                 TEXT,
            provider_conversation_id TEXT,
            sdk_session_id           TEXT,
            session_cursor           TEXT,
            last_session_sync_at     TEXT
        );

        CREATE TABLE IF NOT EXISTS conversation_summaries (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            agent_key       TEXT,
            summary_text    TEXT NOT NULL,
            summary_model   TEXT,
            version         TEXT NOT NULL,
            summary_length_tokens INTEGER,
            created_at      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS workflow_runs (
            id                    TEXT PRIMARY KEY,
            tenant_id             TEXT NOT NULL,
            user_id               TEXT NOT NULL,
            workflow_key          TEXT NOT NULL,
            status                TEXT NOT NULL DEFAULT 'running',
            conversation_id       TEXT NOT NULL,
            request_message       TEXT NOT NULL,
            final_output_text     TEXT,
            final_output_structured TEXT,
            output_schema         TEXT,
            started_at            TEXT NOT NULL,
            ended_at              TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_workflow_runs_tenant
            ON workflow_runs(tenant_id, started_at DESC);

        CREATE TABLE IF NOT EXISTS workflow_steps (
            run_id            TEXT NOT NULL REFERENCES workflow_runs(id),
            sequence_no       INTEGER NOT NULL,
            step_name         TEXT NOT NULL,
            agent_key         TEXT NOT NULL,
            stage_name        TEXT NOT NULL,
            parallel_group    TEXT,
            branch_index      INTEGER,
            response_id       TEXT,
            response_text     TEXT,
            structured_output TEXT,
            output_schema     TEXT,
            status            TEXT NOT NULL,
            created_at        TEXT NOT NULL,
            PRIMARY KEY (run_id, sequence_no)
        );

        CREATE TABLE IF NOT EXISTS run_usage (
            idempotency_key        TEXT PRIMARY KEY,
            conversation_id        TEXT NOT NULL,
            response_id            TEXT NOT NULL,
            run_id                 TEXT,
            agent_key              TEXT,
            provider               TEXT,
            requests               INTEGER NOT NULL DEFAULT 0,
            input_tokens           INTEGER NOT NULL DEFAULT 0,
            output_tokens          INTEGER NOT NULL DEFAULT 0,
            cached_input_tokens    INTEGER NOT NULL DEFAULT 0,
            reasoning_output_tokens INTEGER NOT NULL DEFAULT 0,
            created_at             TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS usage_counters (
            tenant_id     TEXT NOT NULL,
            user_id       TEXT NOT NULL DEFAULT '',
            period_start  TEXT NOT NULL,
            granularity   TEXT NOT NULL,
            input_tokens  INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            requests      INTEGER NOT NULL DEFAULT 0,
            storage_bytes INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (tenant_id, user_id, period_start, granularity)
        );",
    )?;
    Ok(())
}

/// Current UTC timestamp with microsecond precision.
pub(crate) fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}
