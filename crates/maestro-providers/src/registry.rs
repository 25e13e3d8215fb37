use std::collections::HashMap;
use std::sync::Arc;

use maestro_core::config::{MaestroConfig, ProviderRuntime};

use crate::mock::MockProvider;
use crate::openai::OpenAiCompatProvider;
use crate::provider::{AgentDescriptor, AgentProvider, ProviderError};
use crate::session::{MemoryStrategyConfig, MemoryStrategyMode};

/// Registered agents plus the runtime that executes them.
pub struct ProviderRegistry {
    provider: Arc<dyn AgentProvider>,
    agents: HashMap<String, AgentDescriptor>,
    default_agent: String,
}

impl ProviderRegistry {
    pub fn new(provider: Arc<dyn AgentProvider>, default_agent: &str) -> Self {
        let mut registry = Self {
            provider,
            agents: HashMap::new(),
            default_agent: default_agent.to_string(),
        };
        for agent in builtin_agents() {
            registry.register(agent);
        }
        registry
    }

    /// Wire the configured runtime.
    pub fn from_config(config: &MaestroConfig) -> Result<Self, ProviderError> {
        let provider: Arc<dyn AgentProvider> = match config.provider.runtime {
            ProviderRuntime::Mock => Arc::new(MockProvider::new()),
            ProviderRuntime::OpenaiCompat => Arc::new(OpenAiCompatProvider::new(
                config
                    .provider
                    .base_url
                    .clone()
                    .ok_or_else(|| ProviderError::Unavailable("provider.base_url not set".into()))?,
                config.provider.api_key.clone().unwrap_or_default(),
            )),
        };
        Ok(Self::new(provider, &config.provider.default_agent))
    }

    pub fn register(&mut self, agent: AgentDescriptor) {
        self.agents.insert(agent.key.clone(), agent);
    }

    pub fn provider(&self) -> Arc<dyn AgentProvider> {
        Arc::clone(&self.provider)
    }

    /// Resolve an agent descriptor; `None` falls back to the default.
    pub fn resolve(&self, agent_key: Option<&str>) -> Result<AgentDescriptor, ProviderError> {
        let key = agent_key.unwrap_or(&self.default_agent);
        self.agents
            .get(key)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownAgent {
                key: key.to_string(),
            })
    }

    pub fn contains(&self, agent_key: &str) -> bool {
        self.agents.contains_key(agent_key)
    }

    pub fn list(&self) -> Vec<&AgentDescriptor> {
        let mut agents: Vec<&AgentDescriptor> = self.agents.values().collect();
        agents.sort_by(|a, b| a.key.cmp(&b.key));
        agents
    }
}

/// Built-in agent catalog. Deployments extend this via `register`.
fn builtin_agents() -> Vec<AgentDescriptor> {
    vec![
        AgentDescriptor {
            key: "triage".to_string(),
            display_name: Some("Triage".to_string()),
            model: "agent-core-1".to_string(),
            capabilities: vec!["chat".to_string()],
            handoffs: vec!["analysis".to_string(), "code".to_string()],
            memory_strategy_default: Some(MemoryStrategyConfig {
                mode: MemoryStrategyMode::Window,
                ..Default::default()
            }),
            output_schema: None,
        },
        AgentDescriptor {
            key: "analysis".to_string(),
            display_name: Some("Analysis".to_string()),
            model: "agent-core-1".to_string(),
            capabilities: vec!["chat".to_string(), "web_search".to_string()],
            handoffs: vec![],
            memory_strategy_default: None,
            output_schema: None,
        },
        AgentDescriptor {
            key: "code".to_string(),
            display_name: Some("Code".to_string()),
            model: "agent-code-1".to_string(),
            capabilities: vec!["chat".to_string(), "code_interpreter".to_string()],
            handoffs: vec![],
            memory_strategy_default: None,
            output_schema: None,
        },
        AgentDescriptor {
            key: "research".to_string(),
            display_name: Some("Research".to_string()),
            model: "agent-core-1".to_string(),
            capabilities: vec!["chat".to_string(), "web_search".to_string()],
            handoffs: vec![],
            memory_strategy_default: None,
            output_schema: None,
        },
    ]
}
