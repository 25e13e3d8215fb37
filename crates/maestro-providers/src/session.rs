use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::provider::ProviderError;

/// Provider-side container accumulating conversation items across calls.
///
/// Memory strategies wrap a handle and require exactly this surface.
#[async_trait]
pub trait SessionHandle: Send + Sync {
    fn session_id(&self) -> &str;

    /// Items in insertion order. `limit` keeps only the most recent N.
    async fn get_items(&self, limit: Option<usize>) -> Result<Vec<Value>, ProviderError>;

    async fn add_items(&self, items: Vec<Value>) -> Result<(), ProviderError>;

    /// Drop every item (used when a compaction replaces history).
    async fn replace_items(&self, items: Vec<Value>) -> Result<(), ProviderError>;
}

/// Builds session handles for a provider.
pub trait SessionStore: Send + Sync {
    fn build(&self, session_id: &str) -> Arc<dyn SessionHandle>;
}

/// Mints provider-side conversation ids. Optional capability.
#[async_trait]
pub trait ConversationFactory: Send + Sync {
    async fn create(
        &self,
        tenant_id: &str,
        user_id: &str,
        conversation_key: &str,
    ) -> Result<String, ProviderError>;
}

/// Memory compaction behavior applied around a session handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemoryStrategyMode {
    #[default]
    None,
    Window,
    Summarize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStrategyConfig {
    #[serde(default)]
    pub mode: MemoryStrategyMode,
    /// Items kept by `window`, and kept after a `summarize` compaction.
    #[serde(default = "default_window_items")]
    pub window_items: usize,
    /// Item count that triggers a `summarize` compaction.
    #[serde(default = "default_summarize_threshold")]
    pub summarize_threshold: usize,
    #[serde(default = "default_summarizer_model")]
    pub summarizer_model: String,
}

impl Default for MemoryStrategyConfig {
    fn default() -> Self {
        Self {
            mode: MemoryStrategyMode::None,
            window_items: default_window_items(),
            summarize_threshold: default_summarize_threshold(),
            summarizer_model: default_summarizer_model(),
        }
    }
}

fn default_window_items() -> usize {
    20
}

fn default_summarize_threshold() -> usize {
    40
}

fn default_summarizer_model() -> String {
    "summarizer-mini".to_string()
}

/// In-memory session store shared by the mock runtime and providers
/// without server-side session state.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<String, Arc<Mutex<Vec<Value>>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for InMemorySessionStore {
    fn build(&self, session_id: &str) -> Arc<dyn SessionHandle> {
        let items = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone();
        Arc::new(InMemorySessionHandle {
            session_id: session_id.to_string(),
            items,
        })
    }
}

struct InMemorySessionHandle {
    session_id: String,
    items: Arc<Mutex<Vec<Value>>>,
}

#[async_trait]
impl SessionHandle for InMemorySessionHandle {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn get_items(&self, limit: Option<usize>) -> Result<Vec<Value>, ProviderError> {
        let items = self.items.lock().await;
        match limit {
            Some(n) if items.len() > n => Ok(items[items.len() - n..].to_vec()),
            _ => Ok(items.clone()),
        }
    }

    async fn add_items(&self, new_items: Vec<Value>) -> Result<(), ProviderError> {
        self.items.lock().await.extend(new_items);
        Ok(())
    }

    async fn replace_items(&self, new_items: Vec<Value>) -> Result<(), ProviderError> {
        let mut items = self.items.lock().await;
        *items = new_items;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn handles_share_state_per_session_id() {
        let store = InMemorySessionStore::new();
        let a = store.build("s-1");
        a.add_items(vec![json!({"role": "user", "content": "hi"})])
            .await
            .unwrap();

        let b = store.build("s-1");
        assert_eq!(b.get_items(None).await.unwrap().len(), 1);

        let other = store.build("s-2");
        assert!(other.get_items(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_items_honors_the_limit() {
        let store = InMemorySessionStore::new();
        let h = store.build("s");
        for i in 0..5 {
            h.add_items(vec![json!({"i": i})]).await.unwrap();
        }
        let last_two = h.get_items(Some(2)).await.unwrap();
        assert_eq!(last_two, vec![json!({"i": 3}), json!({"i": 4})]);
    }
}
