//! OpenAI-compatible chat-completions runtime.
//!
//! Builds messages from the session handle plus the current turn, parses
//! the JSON (or SSE) response, and records the completed turn back into
//! the session. Transport failures are retried with capped exponential
//! backoff before surfacing as `Unavailable`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::event::{AgentStreamEvent, RunItem, TokenUsage};
use crate::provider::{AgentProvider, AgentRunRequest, AgentRunResponse, ProviderError};
use crate::session::{InMemorySessionStore, SessionStore};

const MAX_TRANSPORT_RETRIES: u32 = 2;
const BACKOFF_BASE_MS: u64 = 250;

pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    sessions: Arc<InMemorySessionStore>,
}

impl OpenAiCompatProvider {
    /// `base_url` should NOT include a trailing slash.
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            sessions: Arc::new(InMemorySessionStore::new()),
        }
    }

    async fn build_messages(&self, req: &AgentRunRequest) -> Result<Vec<Value>, ProviderError> {
        let mut messages = req.session.get_items(None).await?;
        if req.input_items.is_empty() {
            messages.push(json!({"role": "user", "content": req.message}));
        } else {
            // attachments ride along as structured content parts
            let mut parts = vec![json!({"type": "text", "text": req.message})];
            parts.extend(req.input_items.iter().cloned());
            messages.push(json!({"role": "user", "content": parts}));
        }
        Ok(messages)
    }

    async fn post_with_retry(
        &self,
        body: &Value,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let mut attempt = 0u32;
        loop {
            let result = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .header("content-type", "application/json")
                .json(body)
                .send()
                .await;
            match result {
                Ok(resp) => return self.check_status(resp).await,
                Err(e) if attempt < MAX_TRANSPORT_RETRIES => {
                    let delay = BACKOFF_BASE_MS * 2u64.pow(attempt);
                    warn!(error = %e, attempt, delay_ms = delay, "provider transport error, retrying");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => return Err(ProviderError::Unavailable(e.to_string())),
            }
        }
    }

    async fn check_status(
        &self,
        resp: reqwest::Response,
    ) -> Result<reqwest::Response, ProviderError> {
        let status = resp.status().as_u16();
        if status == 429 {
            let retry = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|s| s * 1000)
                .unwrap_or(5000);
            return Err(ProviderError::RateLimited {
                retry_after_ms: retry,
            });
        }
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "provider API error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }
        Ok(resp)
    }

    async fn record_turn(&self, req: &AgentRunRequest, reply: &str) -> Result<(), ProviderError> {
        req.session
            .add_items(vec![
                json!({"role": "user", "content": req.message}),
                json!({"role": "assistant", "content": reply}),
            ])
            .await
    }
}

#[async_trait]
impl AgentProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        "openai_compat"
    }

    async fn run(&self, req: AgentRunRequest) -> Result<AgentRunResponse, ProviderError> {
        let messages = self.build_messages(&req).await?;
        let body = json!({
            "model": req.agent.model,
            "messages": messages,
            "stream": false,
        });
        debug!(model = %req.agent.model, agent = %req.agent.key, "sending provider request");

        let resp = self.post_with_retry(&body).await?;
        let api: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        let content = api
            .choices
            .first()
            .and_then(|c| c.message.as_ref())
            .and_then(|m| m.content.clone())
            .unwrap_or_default();
        let response_id = if api.id.is_empty() {
            new_response_id()
        } else {
            api.id
        };
        let usage = api
            .usage
            .map(|u| TokenUsage {
                requests: 1,
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
                cached_input_tokens: 0,
                reasoning_output_tokens: 0,
            })
            .unwrap_or(TokenUsage {
                requests: 1,
                ..Default::default()
            });

        self.record_turn(&req, &content).await?;

        Ok(AgentRunResponse {
            response_id: response_id.clone(),
            response_text: content.clone(),
            structured_output: None,
            run_items: vec![RunItem {
                item_type: "message".to_string(),
                role: Some("assistant".to_string()),
                response_id: Some(response_id),
                response_text: Some(content),
                name: Some(req.agent.key.clone()),
                ..Default::default()
            }],
            usage,
            agent: req.agent.key,
        })
    }

    async fn run_stream(
        &self,
        req: AgentRunRequest,
        tx: mpsc::Sender<AgentStreamEvent>,
    ) -> Result<(), ProviderError> {
        use futures_util::StreamExt;

        let messages = self.build_messages(&req).await?;
        let body = json!({
            "model": req.agent.model,
            "messages": messages,
            "stream": true,
        });
        debug!(model = %req.agent.model, agent = %req.agent.key, "sending streaming provider request");

        let resp = self.post_with_retry(&body).await?;

        let mut response_id = new_response_id();
        let mut full_text = String::new();
        let mut usage: Option<TokenUsage> = None;
        let mut line_buf = String::new();
        let mut byte_stream = resp.bytes_stream();

        while let Some(chunk) = byte_stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    let _ = tx
                        .send(AgentStreamEvent::Error {
                            code: "provider_unavailable".to_string(),
                            message: e.to_string(),
                        })
                        .await;
                    return Ok(());
                }
            };
            let Ok(text) = std::str::from_utf8(&chunk) else {
                continue;
            };

            line_buf.push_str(text);
            let lines: Vec<&str> = line_buf.split('\n').collect();
            let (complete, remainder) = lines.split_at(lines.len() - 1);
            let remainder = remainder.first().unwrap_or(&"").to_string();

            for line in complete {
                let line = line.trim();
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    continue;
                }
                let Ok(chunk) = serde_json::from_str::<StreamChunk>(data) else {
                    continue;
                };
                if !chunk.id.is_empty() {
                    response_id = chunk.id.clone();
                }
                if let Some(u) = chunk.usage {
                    usage = Some(TokenUsage {
                        requests: 1,
                        input_tokens: u.prompt_tokens,
                        output_tokens: u.completion_tokens,
                        cached_input_tokens: 0,
                        reasoning_output_tokens: 0,
                    });
                }
                let delta = chunk
                    .choices
                    .first()
                    .and_then(|c| c.delta.as_ref())
                    .and_then(|d| d.content.clone());
                if let Some(delta) = delta {
                    full_text.push_str(&delta);
                    if tx
                        .send(AgentStreamEvent::RawDelta {
                            raw_type: "response.output_text.delta".to_string(),
                            text_delta: Some(delta),
                            reasoning_delta: None,
                            response_id: Some(response_id.clone()),
                        })
                        .await
                        .is_err()
                    {
                        return Ok(()); // receiver dropped
                    }
                }
            }
            line_buf = remainder;
        }

        let _ = tx
            .send(AgentStreamEvent::RunItem(Box::new(RunItem {
                item_type: "message".to_string(),
                role: Some("assistant".to_string()),
                response_id: Some(response_id.clone()),
                response_text: Some(full_text.clone()),
                name: Some(req.agent.key.clone()),
                ..Default::default()
            })))
            .await;

        self.record_turn(&req, &full_text).await?;

        let _ = tx
            .send(AgentStreamEvent::Final {
                response_id: Some(response_id),
                response_text: Some(full_text.clone()),
                structured_output: None,
                usage: usage.unwrap_or(TokenUsage {
                    requests: 1,
                    output_tokens: (full_text.len() as u64 / 4).max(1),
                    ..Default::default()
                }),
            })
            .await;
        Ok(())
    }

    fn session_store(&self) -> Arc<dyn SessionStore> {
        Arc::clone(&self.sessions) as Arc<dyn SessionStore>
    }
}

fn new_response_id() -> String {
    format!("resp_{}", Uuid::new_v4().simple())
}

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ApiMessage>,
    delta: Option<ApiMessage>,
}

#[derive(Deserialize)]
struct ApiMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    id: String,
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<ApiUsage>,
}
