//! Memory strategies wrapped around provider session handles.
//!
//! `window` trims history to the most recent N items before each call;
//! `summarize` folds older items into one synthetic summary item once the
//! threshold is crossed, persists the summary, and reports the compaction
//! so the engine can emit a lifecycle frame.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::info;

use maestro_providers::{MemoryStrategyConfig, MemoryStrategyMode, ProviderError, SessionHandle};

/// Reported whenever a summarize compaction replaces history.
#[derive(Debug, Clone)]
pub struct CompactionEvent {
    pub compacted_count: usize,
    pub summary_length_tokens: Option<u64>,
}

/// Persists produced summaries. The session manager wires this to the
/// relational store.
#[async_trait]
pub trait SummarySink: Send + Sync {
    async fn persist(&self, summary_text: &str, summary_length_tokens: Option<u64>);
}

pub struct StrategySession {
    inner: Arc<dyn SessionHandle>,
    config: MemoryStrategyConfig,
    on_summary: Option<Arc<dyn SummarySink>>,
    compaction_tx: Option<mpsc::Sender<CompactionEvent>>,
}

impl StrategySession {
    pub fn new(
        inner: Arc<dyn SessionHandle>,
        config: MemoryStrategyConfig,
        on_summary: Option<Arc<dyn SummarySink>>,
        compaction_tx: Option<mpsc::Sender<CompactionEvent>>,
    ) -> Self {
        Self {
            inner,
            config,
            on_summary,
            compaction_tx,
        }
    }

    /// Fold everything but the trailing window into one summary item.
    async fn compact(&self) -> Result<(), ProviderError> {
        let items = self.inner.get_items(None).await?;
        if items.len() <= self.config.summarize_threshold {
            return Ok(());
        }
        let keep_from = items.len().saturating_sub(self.config.window_items);
        let (older, recent) = items.split_at(keep_from);
        if older.is_empty() {
            return Ok(());
        }

        let summary_text = summarize_items(older);
        let summary_tokens = Some(((summary_text.len() as u64) / 4).max(1));
        let summary_item = json!({
            "role": "system",
            "content": format!("Conversation summary: {summary_text}"),
            "synthetic": true,
        });

        let mut replacement = vec![summary_item];
        replacement.extend_from_slice(recent);
        self.inner.replace_items(replacement).await?;

        if let Some(sink) = &self.on_summary {
            sink.persist(&summary_text, summary_tokens).await;
        }
        if let Some(tx) = &self.compaction_tx {
            let _ = tx
                .send(CompactionEvent {
                    compacted_count: older.len(),
                    summary_length_tokens: summary_tokens,
                })
                .await;
        }
        info!(
            session_id = %self.inner.session_id(),
            compacted = older.len(),
            "memory compaction applied"
        );
        Ok(())
    }
}

#[async_trait]
impl SessionHandle for StrategySession {
    fn session_id(&self) -> &str {
        self.inner.session_id()
    }

    async fn get_items(&self, limit: Option<usize>) -> Result<Vec<Value>, ProviderError> {
        match self.config.mode {
            MemoryStrategyMode::Window => {
                let window = self.config.window_items;
                let effective = match limit {
                    Some(n) => Some(n.min(window)),
                    None => Some(window),
                };
                self.inner.get_items(effective).await
            }
            _ => self.inner.get_items(limit).await,
        }
    }

    async fn add_items(&self, items: Vec<Value>) -> Result<(), ProviderError> {
        self.inner.add_items(items).await?;
        if self.config.mode == MemoryStrategyMode::Summarize {
            self.compact().await?;
        }
        Ok(())
    }

    async fn replace_items(&self, items: Vec<Value>) -> Result<(), ProviderError> {
        self.inner.replace_items(items).await
    }
}

/// Deterministic extractive summary: lead fragments of the compacted turns.
/// A model-backed summarizer can replace this behind `SummarySink`, but the
/// fallback keeps compaction usable without an extra provider call.
fn summarize_items(items: &[Value]) -> String {
    let mut fragments = Vec::new();
    for item in items.iter().take(8) {
        let role = item.get("role").and_then(Value::as_str).unwrap_or("user");
        let content = item.get("content").and_then(Value::as_str).unwrap_or("");
        let lead: String = content.chars().take(60).collect();
        if !lead.is_empty() {
            fragments.push(format!("{role}: {lead}"));
        }
    }
    let mut summary = fragments.join("; ");
    if items.len() > 8 {
        summary.push_str(&format!("; (+{} more turns)", items.len() - 8));
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_providers::session::{InMemorySessionStore, SessionStore};

    fn config(mode: MemoryStrategyMode, window: usize, threshold: usize) -> MemoryStrategyConfig {
        MemoryStrategyConfig {
            mode,
            window_items: window,
            summarize_threshold: threshold,
            summarizer_model: "summarizer-mini".to_string(),
        }
    }

    fn turn(i: usize) -> Value {
        json!({"role": "user", "content": format!("message {i}")})
    }

    #[tokio::test]
    async fn window_mode_trims_reads_only() {
        let store = InMemorySessionStore::new();
        let session = StrategySession::new(
            store.build("s"),
            config(MemoryStrategyMode::Window, 3, 100),
            None,
            None,
        );
        for i in 0..10 {
            session.add_items(vec![turn(i)]).await.unwrap();
        }
        assert_eq!(session.get_items(None).await.unwrap().len(), 3);
        // the underlying store keeps everything
        assert_eq!(store.build("s").get_items(None).await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn summarize_mode_compacts_past_the_threshold() {
        let store = InMemorySessionStore::new();
        let (tx, mut rx) = mpsc::channel(8);
        let session = StrategySession::new(
            store.build("s"),
            config(MemoryStrategyMode::Summarize, 2, 5),
            None,
            Some(tx),
        );
        for i in 0..6 {
            session.add_items(vec![turn(i)]).await.unwrap();
        }

        let event = rx.recv().await.unwrap();
        assert_eq!(event.compacted_count, 4);

        let items = store.build("s").get_items(None).await.unwrap();
        // one synthetic summary + the trailing window
        assert_eq!(items.len(), 3);
        assert_eq!(items[0]["synthetic"], json!(true));
        assert!(items[0]["content"]
            .as_str()
            .unwrap()
            .starts_with("Conversation summary:"));
    }

    #[tokio::test]
    async fn none_mode_is_a_passthrough() {
        let store = InMemorySessionStore::new();
        let session = StrategySession::new(
            store.build("s"),
            MemoryStrategyConfig::default(),
            None,
            None,
        );
        for i in 0..50 {
            session.add_items(vec![turn(i)]).await.unwrap();
        }
        assert_eq!(session.get_items(None).await.unwrap().len(), 50);
    }
}
