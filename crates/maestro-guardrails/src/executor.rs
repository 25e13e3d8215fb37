//! Stage-scoped guardrail execution with bounded concurrency.

use futures_util::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::resolver::{ResolvedGuardrail, ResolvedPipeline};
use crate::spec::{GuardrailCheckResult, GuardrailError, GuardrailStage};

/// One executed check, ready to surface as a `guardrail_result` frame.
#[derive(Debug, Clone)]
pub struct ExecutedGuardrail {
    pub key: String,
    pub stage: GuardrailStage,
    pub suppressed: bool,
    pub result: GuardrailCheckResult,
}

impl ExecutedGuardrail {
    pub fn blocks(&self) -> bool {
        self.result.tripwire_triggered && !self.suppressed
    }
}

/// Outcome of running one stage over one piece of content.
#[derive(Debug, Clone, Default)]
pub struct StageOutcome {
    /// Every executed check, in completion order.
    pub results: Vec<ExecutedGuardrail>,
    /// First non-suppressed tripwire on a blocking stage.
    pub blocked: Option<ExecutedGuardrail>,
    /// Content with triggered spans replaced, for output stages.
    pub redacted_content: Option<String>,
}

impl StageOutcome {
    pub fn tripped(&self) -> bool {
        self.blocked.is_some() || self.redacted_content.is_some()
    }
}

pub struct GuardrailRuntime {
    pipeline: ResolvedPipeline,
}

impl GuardrailRuntime {
    pub fn new(pipeline: ResolvedPipeline) -> Self {
        Self { pipeline }
    }

    pub fn is_empty(&self) -> bool {
        self.pipeline.is_empty()
    }

    /// Run every guardrail registered for `stage` against `content`.
    ///
    /// Blocking stages (pre_flight, input, tool_input) fail fast on the
    /// first non-suppressed tripwire. Output stages run every check, then
    /// redact the matched spans from the content.
    pub async fn run_stage(
        &self,
        stage: GuardrailStage,
        content: &str,
    ) -> Result<StageOutcome, GuardrailError> {
        let guardrails = self.pipeline.for_stage(stage);
        if guardrails.is_empty() {
            return Ok(StageOutcome::default());
        }

        let concurrency = self.pipeline.concurrency.max(1);
        let mut executions = stream::iter(guardrails.into_iter().cloned())
            .map(|g| async move { run_one(&g, content).await })
            .buffer_unordered(concurrency);

        let mut outcome = StageOutcome::default();
        while let Some(executed) = executions.next().await {
            let executed = executed?;
            let blocks = executed.blocks();
            if executed.result.tripwire_triggered {
                debug!(
                    guardrail = %executed.key,
                    stage = stage.as_str(),
                    suppressed = executed.suppressed,
                    "guardrail tripwire triggered"
                );
            }
            if blocks && stage.is_blocking() {
                // fail fast: remaining checks are abandoned mid-flight
                outcome.blocked = Some(executed.clone());
                outcome.results.push(executed);
                return Ok(outcome);
            }
            outcome.results.push(executed);
        }

        if !stage.is_blocking() {
            let redacted = redact(content, &outcome.results);
            if redacted != content {
                outcome.redacted_content = Some(redacted);
            }
        }
        Ok(outcome)
    }
}

async fn run_one(
    guardrail: &ResolvedGuardrail,
    content: &str,
) -> Result<ExecutedGuardrail, GuardrailError> {
    match guardrail.check.check(content, &guardrail.config).await {
        Ok(result) => Ok(ExecutedGuardrail {
            key: guardrail.key.clone(),
            stage: guardrail.stage,
            suppressed: guardrail.suppressed,
            result,
        }),
        Err(e) => {
            warn!(guardrail = %guardrail.key, error = %e, "guardrail check failed");
            Err(e)
        }
    }
}

/// Replace every span matched by a non-suppressed triggered check.
fn redact(content: &str, results: &[ExecutedGuardrail]) -> String {
    let mut redacted = content.to_string();
    for executed in results {
        if !executed.blocks() {
            continue;
        }
        for m in executed.result.matches() {
            if !m.is_empty() {
                redacted = redacted.replace(&m, "[REDACTED]");
            }
        }
    }
    redacted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::GuardrailRegistry;
    use crate::resolver::resolve_pipeline;
    use maestro_core::config::{
        GuardrailBundleConfig, GuardrailOverrideConfig, GuardrailPipelineConfig,
    };
    use serde_json::Value;

    fn runtime(bundle: GuardrailBundleConfig) -> GuardrailRuntime {
        let registry = GuardrailRegistry::builtin();
        let pipeline = resolve_pipeline(
            &registry,
            &GuardrailPipelineConfig {
                bundles: vec![bundle],
            },
        )
        .unwrap();
        GuardrailRuntime::new(pipeline)
    }

    #[tokio::test]
    async fn blocking_stage_fails_fast_on_tripwire() {
        let rt = runtime(GuardrailBundleConfig {
            guardrail_keys: vec!["pii_detection_input".to_string()],
            ..Default::default()
        });
        let outcome = rt
            .run_stage(GuardrailStage::Input, "my ssn is 123-45-6789")
            .await
            .unwrap();
        assert!(outcome.blocked.is_some());
        assert_eq!(outcome.blocked.unwrap().key, "pii_detection_input");
    }

    #[tokio::test]
    async fn suppressed_tripwire_does_not_block() {
        let rt = runtime(GuardrailBundleConfig {
            guardrail_keys: vec!["pii_detection_input".to_string()],
            suppress_tripwire: true,
            ..Default::default()
        });
        let outcome = rt
            .run_stage(GuardrailStage::Input, "my ssn is 123-45-6789")
            .await
            .unwrap();
        assert!(outcome.blocked.is_none());
        assert!(outcome.results[0].result.tripwire_triggered);
    }

    #[tokio::test]
    async fn output_stage_redacts_matched_spans() {
        let rt = runtime(GuardrailBundleConfig {
            guardrail_keys: vec!["pii_detection_output".to_string()],
            ..Default::default()
        });
        let outcome = rt
            .run_stage(
                GuardrailStage::Output,
                "sure, the ssn is 123-45-6789 as requested",
            )
            .await
            .unwrap();
        assert_eq!(
            outcome.redacted_content.as_deref(),
            Some("sure, the ssn is [REDACTED] as requested")
        );
    }

    #[tokio::test]
    async fn clean_content_passes_untouched() {
        let rt = runtime(GuardrailBundleConfig {
            preset: Some("default".to_string()),
            ..Default::default()
        });
        let outcome = rt
            .run_stage(GuardrailStage::Output, "nothing sensitive here")
            .await
            .unwrap();
        assert!(!outcome.tripped());
        assert!(outcome.redacted_content.is_none());
    }

    #[tokio::test]
    async fn stage_with_no_guardrails_is_a_noop() {
        let rt = runtime(GuardrailBundleConfig {
            guardrails: vec![GuardrailOverrideConfig {
                guardrail_key: "pii_detection_output".to_string(),
                enabled: true,
                config: Value::Null,
            }],
            ..Default::default()
        });
        let outcome = rt
            .run_stage(GuardrailStage::ToolOutput, "anything")
            .await
            .unwrap();
        assert!(outcome.results.is_empty());
    }
}
