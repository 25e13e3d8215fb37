//! Deterministic runtime for tests and the development profile.
//!
//! Echoes the user message back with the agent key so end-to-end flows can
//! assert on content without a live model, keeps session items in memory,
//! and mints `conv_`-prefixed conversation ids.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::event::{AgentStreamEvent, RunItem, TokenUsage};
use crate::provider::{AgentProvider, AgentRunRequest, AgentRunResponse, ProviderError};
use crate::session::{ConversationFactory, InMemorySessionStore, SessionStore};

pub struct MockProvider {
    sessions: Arc<InMemorySessionStore>,
    factory: Arc<MockConversationFactory>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(InMemorySessionStore::new()),
            factory: Arc::new(MockConversationFactory),
        }
    }

    fn reply_for(&self, req: &AgentRunRequest) -> String {
        format!("[{}] {}", req.agent.key, req.message)
    }

    fn usage_for(message: &str, reply: &str) -> TokenUsage {
        TokenUsage {
            requests: 1,
            input_tokens: (message.len() as u64 / 4).max(1),
            output_tokens: (reply.len() as u64 / 4).max(1),
            cached_input_tokens: 0,
            reasoning_output_tokens: 0,
        }
    }

    async fn record_turn(
        &self,
        req: &AgentRunRequest,
        reply: &str,
    ) -> Result<(), ProviderError> {
        req.session
            .add_items(vec![
                json!({"role": "user", "content": req.message}),
                json!({"role": "assistant", "content": reply}),
            ])
            .await
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn run(&self, req: AgentRunRequest) -> Result<AgentRunResponse, ProviderError> {
        let reply = self.reply_for(&req);
        let response_id = new_response_id();
        self.record_turn(&req, &reply).await?;
        Ok(AgentRunResponse {
            response_id: response_id.clone(),
            response_text: reply.clone(),
            structured_output: None,
            run_items: vec![RunItem {
                item_type: "message".to_string(),
                role: Some("assistant".to_string()),
                response_id: Some(response_id),
                response_text: Some(reply.clone()),
                name: Some(req.agent.key.clone()),
                ..Default::default()
            }],
            usage: Self::usage_for(&req.message, &reply),
            agent: req.agent.key,
        })
    }

    async fn run_stream(
        &self,
        req: AgentRunRequest,
        tx: mpsc::Sender<AgentStreamEvent>,
    ) -> Result<(), ProviderError> {
        let reply = self.reply_for(&req);
        let response_id = new_response_id();

        // word-by-word deltas so clients exercise real concatenation
        let words: Vec<&str> = reply.split_inclusive(' ').collect();
        for word in &words {
            if tx
                .send(AgentStreamEvent::RawDelta {
                    raw_type: "response.output_text.delta".to_string(),
                    text_delta: Some((*word).to_string()),
                    reasoning_delta: None,
                    response_id: Some(response_id.clone()),
                })
                .await
                .is_err()
            {
                return Ok(()); // receiver dropped
            }
        }

        let _ = tx
            .send(AgentStreamEvent::RunItem(Box::new(RunItem {
                item_type: "message".to_string(),
                role: Some("assistant".to_string()),
                response_id: Some(response_id.clone()),
                response_text: Some(reply.clone()),
                name: Some(req.agent.key.clone()),
                ..Default::default()
            })))
            .await;

        self.record_turn(&req, &reply).await?;

        let _ = tx
            .send(AgentStreamEvent::Final {
                response_id: Some(response_id),
                response_text: Some(reply.clone()),
                structured_output: None,
                usage: Self::usage_for(&req.message, &reply),
            })
            .await;
        Ok(())
    }

    fn session_store(&self) -> Arc<dyn SessionStore> {
        Arc::clone(&self.sessions) as Arc<dyn SessionStore>
    }

    fn conversation_factory(&self) -> Option<Arc<dyn ConversationFactory>> {
        Some(Arc::clone(&self.factory) as Arc<dyn ConversationFactory>)
    }
}

struct MockConversationFactory;

#[async_trait]
impl ConversationFactory for MockConversationFactory {
    async fn create(
        &self,
        _tenant_id: &str,
        _user_id: &str,
        _conversation_key: &str,
    ) -> Result<String, ProviderError> {
        Ok(format!("conv_{}", Uuid::new_v4().simple()))
    }
}

fn new_response_id() -> String {
    format!("resp_{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::AgentDescriptor;
    use crate::session::SessionStore;

    fn request(provider: &MockProvider, message: &str) -> AgentRunRequest {
        AgentRunRequest {
            agent: AgentDescriptor {
                key: "triage".to_string(),
                display_name: None,
                model: "agent-core-1".to_string(),
                capabilities: vec![],
                handoffs: vec![],
                memory_strategy_default: None,
                output_schema: None,
            },
            message: message.to_string(),
            input_items: vec![],
            session: provider.session_store().build("s-1"),
            provider_conversation_id: None,
            conversation_id: "c-1".to_string(),
            metadata: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn run_echoes_and_records_the_turn() {
        let provider = MockProvider::new();
        let resp = provider.run(request(&provider, "hi")).await.unwrap();
        assert_eq!(resp.response_text, "[triage] hi");
        assert!(resp.response_id.starts_with("resp_"));
        assert_eq!(resp.usage.requests, 1);

        let items = provider
            .session_store()
            .build("s-1")
            .get_items(None)
            .await
            .unwrap();
        assert_eq!(items.len(), 2);
    }

    #[tokio::test]
    async fn stream_deltas_concatenate_to_the_final_text() {
        let provider = MockProvider::new();
        let (tx, mut rx) = mpsc::channel(64);
        provider
            .run_stream(request(&provider, "tell me a story"), tx)
            .await
            .unwrap();

        let mut concatenated = String::new();
        let mut final_text = None;
        let mut terminal_count = 0;
        while let Some(event) = rx.recv().await {
            match event {
                AgentStreamEvent::RawDelta { text_delta, .. } => {
                    concatenated.push_str(&text_delta.unwrap_or_default());
                }
                AgentStreamEvent::Final { response_text, .. } => {
                    final_text = response_text;
                    terminal_count += 1;
                }
                _ => {}
            }
        }
        assert_eq!(terminal_count, 1);
        assert_eq!(final_text.as_deref(), Some(concatenated.as_str()));
    }

    #[tokio::test]
    async fn factory_mints_conv_prefixed_ids() {
        let provider = MockProvider::new();
        let factory = provider.conversation_factory().unwrap();
        let id = factory.create("t", "u", "key").await.unwrap();
        assert!(id.starts_with("conv_"));
    }
}
