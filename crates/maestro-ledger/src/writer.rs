//! Durable ledger write path.
//!
//! Appends are serialized per conversation so `event_id` stays dense and
//! strictly monotonic; that lock is the only cross-request ordering the
//! platform guarantees. Payloads over the inline threshold are gzipped
//! and spilled to the object store with a sha256 checksum. A write that
//! exceeds the deadline logs and lets the stream continue; replay
//! surfaces the gap as an incidental read error.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::warn;

use maestro_core::config::LedgerConfig;
use maestro_core::types::{ConversationId, TenantId};
use maestro_protocol::frames::StreamFrame;
use maestro_storage::port::ledger_payload_key;
use maestro_storage::ObjectStore;
use maestro_store::types::NewLedgerEvent;
use maestro_store::Store;

use crate::error::Result;

struct ConversationCursor {
    next_event_id: u64,
}

pub struct LedgerWriter {
    store: Arc<Store>,
    objects: Arc<dyn ObjectStore>,
    cursors: DashMap<ConversationId, Arc<Mutex<Option<ConversationCursor>>>>,
    inline_max_bytes: usize,
    write_deadline: Duration,
}

impl LedgerWriter {
    pub fn new(store: Arc<Store>, objects: Arc<dyn ObjectStore>, config: &LedgerConfig) -> Self {
        Self {
            store,
            objects,
            cursors: DashMap::new(),
            inline_max_bytes: config.inline_max_bytes,
            write_deadline: Duration::from_millis(config.write_deadline_ms),
        }
    }

    /// Assign the next event id, build the frame, and persist it.
    ///
    /// `build` receives the assigned id and returns the complete frame;
    /// the returned frame is what the caller delivers to the client. The
    /// per-conversation lock is held across id assignment and persistence
    /// so concurrent streams interleave without ever sharing an id.
    pub async fn record<F>(
        &self,
        tenant_id: TenantId,
        conversation_id: ConversationId,
        workflow_run_id: Option<&str>,
        build: F,
    ) -> Result<StreamFrame>
    where
        F: FnOnce(u64) -> StreamFrame,
    {
        let cursor = self
            .cursors
            .entry(conversation_id)
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone();
        let mut guard = cursor.lock().await;

        let next_id = match guard.as_ref() {
            Some(c) => c.next_event_id,
            None => self.store.max_ledger_event_id(conversation_id)?.map_or(1, |m| m + 1),
        };
        let frame = build(next_id);
        *guard = Some(ConversationCursor {
            next_event_id: next_id + 1,
        });

        let persist = self.persist(tenant_id, conversation_id, workflow_run_id, &frame);
        match tokio::time::timeout(self.write_deadline, persist).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                // The frame is still delivered; the replay surfaces a gap.
                warn!(
                    conversation_id = %conversation_id,
                    event_id = frame.event_id,
                    error = %e,
                    "ledger write failed"
                );
            }
            Err(_) => {
                warn!(
                    conversation_id = %conversation_id,
                    event_id = frame.event_id,
                    deadline_ms = self.write_deadline.as_millis() as u64,
                    "ledger write exceeded deadline"
                );
            }
        }
        Ok(frame)
    }

    async fn persist(
        &self,
        tenant_id: TenantId,
        conversation_id: ConversationId,
        workflow_run_id: Option<&str>,
        frame: &StreamFrame,
    ) -> Result<()> {
        let json = serde_json::to_string(frame)?;
        let size = json.len();

        let event = if size <= self.inline_max_bytes {
            NewLedgerEvent {
                tenant_id,
                conversation_id,
                event_id: frame.event_id,
                stream_id: frame.stream_id.clone(),
                workflow_run_id: workflow_run_id.map(String::from),
                kind: kind_str(frame),
                payload_inline_json: Some(json),
                payload_object_key: None,
                payload_size_bytes: size as u64,
                payload_sha256: None,
            }
        } else {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(json.as_bytes())?;
            let compressed = encoder.finish()?;
            let sha256 = hex::encode(Sha256::digest(&compressed));
            let key = ledger_payload_key(
                &tenant_id.to_string(),
                &conversation_id.to_string(),
                frame.event_id,
            );
            self.objects
                .put_object(&key, compressed, "application/gzip")
                .await?;
            NewLedgerEvent {
                tenant_id,
                conversation_id,
                event_id: frame.event_id,
                stream_id: frame.stream_id.clone(),
                workflow_run_id: workflow_run_id.map(String::from),
                kind: kind_str(frame),
                payload_inline_json: None,
                payload_object_key: Some(key),
                payload_size_bytes: size as u64,
                payload_sha256: Some(sha256),
            }
        };

        self.store.insert_ledger_event(&event)?;
        Ok(())
    }
}

fn kind_str(frame: &StreamFrame) -> String {
    serde_json::to_value(frame.kind)
        .ok()
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_else(|| "unknown".to_string())
}
