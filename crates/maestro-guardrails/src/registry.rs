use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::checks::{MessageLengthCheck, PiiCheck, PromptInjectionCheck, UrlFilterCheck};
use crate::spec::{GuardrailEngine, GuardrailSpec, GuardrailStage};

/// One preset entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresetEntry {
    pub guardrail_key: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailPreset {
    pub key: String,
    pub guardrails: Vec<PresetEntry>,
}

/// Specs and presets loaded at startup.
pub struct GuardrailRegistry {
    specs: HashMap<String, GuardrailSpec>,
    presets: HashMap<String, GuardrailPreset>,
}

impl GuardrailRegistry {
    pub fn new() -> Self {
        Self {
            specs: HashMap::new(),
            presets: HashMap::new(),
        }
    }

    /// Registry with every built-in check and the `default` preset.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        let pii = Arc::new(PiiCheck::new());

        registry.register(GuardrailSpec {
            key: "pii_detection_input".to_string(),
            display_name: "PII detection (input)".to_string(),
            description: "Blocks user input containing emails, SSNs, or card numbers".to_string(),
            stage: GuardrailStage::Input,
            engine: GuardrailEngine::Regex,
            default_config: json!({"entities": ["email", "us_ssn", "credit_card"]}),
            check: pii.clone(),
        });
        registry.register(GuardrailSpec {
            key: "pii_detection_output".to_string(),
            display_name: "PII detection (output)".to_string(),
            description: "Redacts emails, SSNs, and card numbers from model output".to_string(),
            stage: GuardrailStage::Output,
            engine: GuardrailEngine::Regex,
            default_config: json!({"entities": ["email", "us_ssn", "credit_card"]}),
            check: pii,
        });
        registry.register(GuardrailSpec {
            key: "url_filter_output".to_string(),
            display_name: "URL filter".to_string(),
            description: "Redacts links to disallowed domains from model output".to_string(),
            stage: GuardrailStage::Output,
            engine: GuardrailEngine::Regex,
            default_config: json!({"block_domains": [], "allow_domains": []}),
            check: Arc::new(UrlFilterCheck::new()),
        });
        registry.register(GuardrailSpec {
            key: "prompt_injection_input".to_string(),
            display_name: "Prompt injection heuristics".to_string(),
            description: "Blocks common jailbreak phrasings in user input".to_string(),
            stage: GuardrailStage::Input,
            engine: GuardrailEngine::Regex,
            default_config: json!({}),
            check: Arc::new(PromptInjectionCheck),
        });
        registry.register(GuardrailSpec {
            key: "message_length_pre_flight".to_string(),
            display_name: "Message length".to_string(),
            description: "Rejects oversized requests before any provider work".to_string(),
            stage: GuardrailStage::PreFlight,
            engine: GuardrailEngine::Regex,
            default_config: json!({"max_chars": 20000}),
            check: Arc::new(MessageLengthCheck),
        });

        registry.register_preset(GuardrailPreset {
            key: "default".to_string(),
            guardrails: vec![
                PresetEntry {
                    guardrail_key: "message_length_pre_flight".to_string(),
                    enabled: true,
                    config: serde_json::Value::Null,
                },
                PresetEntry {
                    guardrail_key: "pii_detection_output".to_string(),
                    enabled: true,
                    config: serde_json::Value::Null,
                },
            ],
        });
        registry
    }

    pub fn register(&mut self, spec: GuardrailSpec) {
        self.specs.insert(spec.key.clone(), spec);
    }

    pub fn register_preset(&mut self, preset: GuardrailPreset) {
        self.presets.insert(preset.key.clone(), preset);
    }

    pub fn get_spec(&self, key: &str) -> Option<&GuardrailSpec> {
        self.specs.get(key)
    }

    pub fn get_preset(&self, key: &str) -> Option<&GuardrailPreset> {
        self.presets.get(key)
    }

    pub fn list_specs(&self) -> Vec<&GuardrailSpec> {
        let mut specs: Vec<&GuardrailSpec> = self.specs.values().collect();
        specs.sort_by(|a, b| a.key.cmp(&b.key));
        specs
    }
}

impl Default for GuardrailRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn default_true() -> bool {
    true
}
