//! Ledger read paths: history pages and replay streaming.

use std::io::Read;
use std::sync::Arc;

use flate2::read::GzDecoder;
use futures_util::Stream;
use serde_json::Value;
use tracing::debug;

use maestro_core::types::{ConversationId, TenantId};
use maestro_storage::ObjectStore;
use maestro_store::types::LedgerEventRef;
use maestro_store::Store;

use crate::cursor::LedgerCursor;
use crate::error::{LedgerError, Result};

const REPLAY_PAGE_SIZE: usize = 500;

pub struct LedgerReader {
    store: Arc<Store>,
    objects: Arc<dyn ObjectStore>,
}

impl LedgerReader {
    pub fn new(store: Arc<Store>, objects: Arc<dyn ObjectStore>) -> Self {
        Self { store, objects }
    }

    /// Tenant-scoping preflight: a mismatched tenant sees not-found
    /// before any payload work happens.
    pub fn check_access(&self, tenant_id: TenantId, conversation_id: ConversationId) -> Result<()> {
        match self.store.get_conversation(tenant_id, conversation_id)? {
            Some(_) => Ok(()),
            None => Err(LedgerError::ConversationNotFound),
        }
    }

    /// One ordered page of decoded frames plus the next cursor.
    pub async fn get_events_page(
        &self,
        tenant_id: TenantId,
        conversation_id: ConversationId,
        workflow_run_id: Option<&str>,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<(Vec<Value>, Option<String>)> {
        self.check_access(tenant_id, conversation_id)?;
        let after = cursor
            .map(LedgerCursor::decode)
            .transpose()?
            .map(|c| c.last_event_id);

        // fetch one extra row to learn whether another page exists
        let refs = self.store.list_ledger_events(
            conversation_id,
            after,
            limit + 1,
            workflow_run_id,
        )?;
        let has_more = refs.len() > limit;
        let page: Vec<LedgerEventRef> = refs.into_iter().take(limit).collect();

        let next_cursor = if has_more {
            page.last().map(|r| {
                LedgerCursor {
                    last_event_id: r.event_id,
                }
                .encode()
            })
        } else {
            None
        };

        let mut frames = Vec::with_capacity(page.len());
        for r in &page {
            frames.push(self.load_payload(r).await?);
        }
        Ok((frames, next_cursor))
    }

    /// Every recorded frame from `cursor` on, as raw JSON text, for SSE
    /// replay. Pages internally; order follows `event_id`.
    pub fn replay_json(
        self: Arc<Self>,
        conversation_id: ConversationId,
        workflow_run_id: Option<String>,
        cursor: Option<LedgerCursor>,
    ) -> impl Stream<Item = Result<String>> {
        async_stream::try_stream! {
            let mut after = cursor.map(|c| c.last_event_id);
            loop {
                let refs = self.store.list_ledger_events(
                    conversation_id,
                    after,
                    REPLAY_PAGE_SIZE,
                    workflow_run_id.as_deref(),
                )?;
                if refs.is_empty() {
                    break;
                }
                after = refs.last().map(|r| r.event_id);
                for r in refs {
                    let text = self.load_payload_text(&r).await?;
                    yield text;
                }
            }
            debug!(conversation_id = %conversation_id, "ledger replay complete");
        }
    }

    async fn load_payload_text(&self, r: &LedgerEventRef) -> Result<String> {
        if let Some(inline) = &r.payload_inline_json {
            return Ok(inline.clone());
        }
        let key = r
            .payload_object_key
            .as_ref()
            .ok_or(LedgerError::MissingPayload {
                event_id: r.event_id,
            })?;
        let compressed = self.objects.get_object_bytes(key).await?;
        let mut decoder = GzDecoder::new(compressed.as_slice());
        let mut text = String::new();
        decoder.read_to_string(&mut text)?;
        Ok(text)
    }

    async fn load_payload(&self, r: &LedgerEventRef) -> Result<Value> {
        let text = self.load_payload_text(r).await?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use maestro_core::config::LedgerConfig;
    use maestro_protocol::frames::FrameEnvelope;
    use maestro_storage::memory::MemoryObjectStore;

    use crate::writer::LedgerWriter;

    struct Fixture {
        reader: Arc<LedgerReader>,
        writer: Arc<LedgerWriter>,
        tenant: TenantId,
        other_tenant: TenantId,
        conv: ConversationId,
    }

    fn fixture(inline_max: usize) -> Fixture {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let tenant = store.create_tenant("acme", "Acme").unwrap();
        let other = store.create_tenant("rival", "Rival").unwrap();
        let conv = ConversationId::from_key("thread");
        store
            .get_or_create_conversation(tenant.id, conv, "thread", None)
            .unwrap();
        let objects: Arc<MemoryObjectStore> = Arc::new(MemoryObjectStore::new());
        Fixture {
            reader: Arc::new(LedgerReader::new(Arc::clone(&store), objects.clone())),
            writer: Arc::new(LedgerWriter::new(
                store,
                objects,
                &LedgerConfig {
                    inline_max_bytes: inline_max,
                    write_deadline_ms: 2_000,
                },
            )),
            tenant: tenant.id,
            other_tenant: other.id,
            conv,
        }
    }

    async fn emit(f: &Fixture, n: usize, text: &str) -> Vec<String> {
        let env = FrameEnvelope::new(f.conv.to_string());
        let mut emitted = Vec::new();
        for _ in 0..n {
            let frame = f
                .writer
                .record(f.tenant, f.conv, None, |id| {
                    env.raw_response(
                        id,
                        "response.output_text.delta",
                        Some(text.to_string()),
                        None,
                        None,
                    )
                })
                .await
                .unwrap();
            emitted.push(serde_json::to_string(&frame).unwrap());
        }
        emitted
    }

    #[tokio::test]
    async fn inline_round_trip_is_byte_equal() {
        let f = fixture(32 * 1024);
        let emitted = emit(&f, 3, "hello").await;
        let (frames, next) = f
            .reader
            .get_events_page(f.tenant, f.conv, None, 10, None)
            .await
            .unwrap();
        assert!(next.is_none());
        for (frame, original) in frames.iter().zip(&emitted) {
            assert_eq!(serde_json::to_string(frame).unwrap(), *original);
        }
    }

    #[tokio::test]
    async fn spilled_round_trip_is_byte_equal() {
        let f = fixture(16); // force every frame to spill
        let emitted = emit(&f, 2, &"y".repeat(200)).await;
        let (frames, _) = f
            .reader
            .get_events_page(f.tenant, f.conv, None, 10, None)
            .await
            .unwrap();
        assert_eq!(frames.len(), 2);
        for (frame, original) in frames.iter().zip(&emitted) {
            assert_eq!(serde_json::to_string(frame).unwrap(), *original);
        }
    }

    #[tokio::test]
    async fn pagination_walks_to_a_null_cursor() {
        let f = fixture(32 * 1024);
        emit(&f, 5, "x").await;
        let mut cursor: Option<String> = None;
        let mut seen = Vec::new();
        loop {
            let (frames, next) = f
                .reader
                .get_events_page(f.tenant, f.conv, None, 2, cursor.as_deref())
                .await
                .unwrap();
            seen.extend(
                frames
                    .iter()
                    .map(|v| v["event_id"].as_u64().unwrap()),
            );
            match next {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn cross_tenant_read_is_not_found() {
        let f = fixture(32 * 1024);
        emit(&f, 1, "x").await;
        assert!(matches!(
            f.reader
                .get_events_page(f.other_tenant, f.conv, None, 10, None)
                .await
                .unwrap_err(),
            LedgerError::ConversationNotFound
        ));
    }

    #[tokio::test]
    async fn replay_preserves_event_ids_in_order() {
        let f = fixture(32 * 1024);
        let emitted = emit(&f, 4, "delta").await;
        let stream = Arc::clone(&f.reader).replay_json(f.conv, None, None);
        let replayed: Vec<String> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(replayed.len(), emitted.len());
        for (r, e) in replayed.iter().zip(&emitted) {
            assert_eq!(r, e);
        }
    }

    #[tokio::test]
    async fn bad_cursor_is_a_validation_error() {
        let f = fixture(32 * 1024);
        assert!(matches!(
            f.reader
                .get_events_page(f.tenant, f.conv, None, 10, Some("garbage!"))
                .await
                .unwrap_err(),
            LedgerError::InvalidCursor
        ));
    }
}
