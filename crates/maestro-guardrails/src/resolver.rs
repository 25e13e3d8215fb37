//! Resolution of the effective guardrail set from a pipeline config.
//!
//! Per bundle: preset entries first (enabled only), then explicit keys
//! with spec defaults, then explicit configs (enabled merges
//! default+override, disabled removes). Every resolved config is
//! validated; validation errors are fatal at resolve time. The effective
//! concurrency is the minimum across bundles that set one.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use maestro_core::config::{GuardrailBundleConfig, GuardrailPipelineConfig};

use crate::registry::GuardrailRegistry;
use crate::spec::{GuardrailCheck, GuardrailError, GuardrailStage};

const DEFAULT_CONCURRENCY: usize = 4;

/// One guardrail ready for execution.
#[derive(Clone)]
pub struct ResolvedGuardrail {
    pub key: String,
    pub stage: GuardrailStage,
    pub config: Value,
    pub suppressed: bool,
    pub check: Arc<dyn GuardrailCheck>,
}

impl std::fmt::Debug for ResolvedGuardrail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedGuardrail")
            .field("key", &self.key)
            .field("stage", &self.stage)
            .field("config", &self.config)
            .field("suppressed", &self.suppressed)
            .finish()
    }
}

#[derive(Clone, Default, Debug)]
pub struct ResolvedPipeline {
    pub guardrails: Vec<ResolvedGuardrail>,
    pub concurrency: usize,
}

impl ResolvedPipeline {
    pub fn for_stage(&self, stage: GuardrailStage) -> Vec<&ResolvedGuardrail> {
        self.guardrails.iter().filter(|g| g.stage == stage).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.guardrails.is_empty()
    }
}

pub fn resolve_pipeline(
    registry: &GuardrailRegistry,
    config: &GuardrailPipelineConfig,
) -> Result<ResolvedPipeline, GuardrailError> {
    // BTreeMap keeps resolution deterministic across runs.
    let mut merged: BTreeMap<String, ResolvedGuardrail> = BTreeMap::new();
    let mut concurrency = DEFAULT_CONCURRENCY;

    for bundle in &config.bundles {
        if let Some(c) = bundle.concurrency {
            concurrency = concurrency.min(c.max(1));
        }
        for resolved in resolve_bundle(registry, bundle)? {
            merged.insert(resolved.key.clone(), resolved);
        }
    }

    Ok(ResolvedPipeline {
        guardrails: merged.into_values().collect(),
        concurrency,
    })
}

fn resolve_bundle(
    registry: &GuardrailRegistry,
    bundle: &GuardrailBundleConfig,
) -> Result<Vec<ResolvedGuardrail>, GuardrailError> {
    let mut result: BTreeMap<String, (GuardrailStage, Value, Arc<dyn GuardrailCheck>)> =
        BTreeMap::new();

    // 1. preset entries (enabled only)
    if let Some(preset_key) = &bundle.preset {
        let preset = registry
            .get_preset(preset_key)
            .ok_or_else(|| GuardrailError::UnknownPreset {
                key: preset_key.clone(),
            })?;
        for entry in &preset.guardrails {
            if !entry.enabled {
                continue;
            }
            let spec = registry.get_spec(&entry.guardrail_key).ok_or_else(|| {
                GuardrailError::UnknownGuardrail {
                    key: entry.guardrail_key.clone(),
                }
            })?;
            let merged = merge_config(&spec.default_config, &entry.config);
            result.insert(spec.key.clone(), (spec.stage, merged, spec.check.clone()));
        }
    }

    // 2. explicit keys, spec defaults
    for key in &bundle.guardrail_keys {
        let spec = registry
            .get_spec(key)
            .ok_or_else(|| GuardrailError::UnknownGuardrail { key: key.clone() })?;
        result
            .entry(spec.key.clone())
            .or_insert_with(|| (spec.stage, spec.default_config.clone(), spec.check.clone()));
    }

    // 3. explicit configs: enabled overrides, disabled removes
    for entry in &bundle.guardrails {
        let spec = registry.get_spec(&entry.guardrail_key).ok_or_else(|| {
            GuardrailError::UnknownGuardrail {
                key: entry.guardrail_key.clone(),
            }
        })?;
        if entry.enabled {
            let merged = merge_config(&spec.default_config, &entry.config);
            result.insert(spec.key.clone(), (spec.stage, merged, spec.check.clone()));
        } else {
            result.remove(&spec.key);
        }
    }

    // validate every surviving config
    let mut out = Vec::with_capacity(result.len());
    for (key, (stage, config, check)) in result {
        check
            .validate_config(&config)
            .map_err(|e| GuardrailError::InvalidConfig {
                key: key.clone(),
                reason: e.to_string(),
            })?;
        out.push(ResolvedGuardrail {
            key,
            stage,
            config,
            suppressed: bundle.suppress_tripwire,
            check,
        });
    }
    Ok(out)
}

/// Shallow-merge an override object onto the default config.
fn merge_config(default: &Value, overrides: &Value) -> Value {
    match (default, overrides) {
        (Value::Object(base), Value::Object(extra)) => {
            let mut merged = base.clone();
            for (k, v) in extra {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        (_, Value::Null) => default.clone(),
        (_, other) => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_core::config::GuardrailOverrideConfig;
    use serde_json::json;

    fn pipeline(bundles: Vec<GuardrailBundleConfig>) -> GuardrailPipelineConfig {
        GuardrailPipelineConfig { bundles }
    }

    #[test]
    fn preset_resolves_enabled_entries() {
        let registry = GuardrailRegistry::builtin();
        let resolved = resolve_pipeline(
            &registry,
            &pipeline(vec![GuardrailBundleConfig {
                preset: Some("default".to_string()),
                ..Default::default()
            }]),
        )
        .unwrap();
        let keys: Vec<&str> = resolved.guardrails.iter().map(|g| g.key.as_str()).collect();
        assert_eq!(keys, vec!["message_length_pre_flight", "pii_detection_output"]);
    }

    #[test]
    fn explicit_disable_removes_a_preset_entry() {
        let registry = GuardrailRegistry::builtin();
        let resolved = resolve_pipeline(
            &registry,
            &pipeline(vec![GuardrailBundleConfig {
                preset: Some("default".to_string()),
                guardrails: vec![GuardrailOverrideConfig {
                    guardrail_key: "pii_detection_output".to_string(),
                    enabled: false,
                    config: Value::Null,
                }],
                ..Default::default()
            }]),
        )
        .unwrap();
        let keys: Vec<&str> = resolved.guardrails.iter().map(|g| g.key.as_str()).collect();
        assert_eq!(keys, vec!["message_length_pre_flight"]);
    }

    #[test]
    fn explicit_config_merges_onto_defaults() {
        let registry = GuardrailRegistry::builtin();
        let resolved = resolve_pipeline(
            &registry,
            &pipeline(vec![GuardrailBundleConfig {
                guardrails: vec![GuardrailOverrideConfig {
                    guardrail_key: "message_length_pre_flight".to_string(),
                    enabled: true,
                    config: json!({"max_chars": 100}),
                }],
                ..Default::default()
            }]),
        )
        .unwrap();
        assert_eq!(resolved.guardrails[0].config["max_chars"], json!(100));
    }

    #[test]
    fn invalid_config_is_fatal_at_resolve_time() {
        let registry = GuardrailRegistry::builtin();
        let err = resolve_pipeline(
            &registry,
            &pipeline(vec![GuardrailBundleConfig {
                guardrails: vec![GuardrailOverrideConfig {
                    guardrail_key: "pii_detection_output".to_string(),
                    enabled: true,
                    config: json!({"entities": ["passport"]}),
                }],
                ..Default::default()
            }]),
        )
        .unwrap_err();
        assert!(matches!(err, GuardrailError::InvalidConfig { .. }));
    }

    #[test]
    fn unknown_keys_and_presets_fail() {
        let registry = GuardrailRegistry::builtin();
        assert!(resolve_pipeline(
            &registry,
            &pipeline(vec![GuardrailBundleConfig {
                guardrail_keys: vec!["nope".to_string()],
                ..Default::default()
            }]),
        )
        .is_err());
        assert!(resolve_pipeline(
            &registry,
            &pipeline(vec![GuardrailBundleConfig {
                preset: Some("nope".to_string()),
                ..Default::default()
            }]),
        )
        .is_err());
    }

    #[test]
    fn concurrency_is_the_minimum_across_bundles() {
        let registry = GuardrailRegistry::builtin();
        let resolved = resolve_pipeline(
            &registry,
            &pipeline(vec![
                GuardrailBundleConfig {
                    preset: Some("default".to_string()),
                    concurrency: Some(3),
                    ..Default::default()
                },
                GuardrailBundleConfig {
                    guardrail_keys: vec!["prompt_injection_input".to_string()],
                    concurrency: Some(2),
                    ..Default::default()
                },
            ]),
        )
        .unwrap();
        assert_eq!(resolved.concurrency, 2);
        assert_eq!(resolved.guardrails.len(), 3);
    }

    #[test]
    fn suppression_is_a_bundle_option() {
        let registry = GuardrailRegistry::builtin();
        let resolved = resolve_pipeline(
            &registry,
            &pipeline(vec![GuardrailBundleConfig {
                guardrail_keys: vec!["pii_detection_output".to_string()],
                suppress_tripwire: true,
                ..Default::default()
            }]),
        )
        .unwrap();
        assert!(resolved.guardrails[0].suppressed);
    }
}
