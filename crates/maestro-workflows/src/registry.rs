use std::collections::HashMap;
use std::sync::Arc;

use maestro_providers::ProviderRegistry;

use crate::callables::CallableRegistry;
use crate::error::{Result, WorkflowError};
use crate::spec::{StageMode, WorkflowDescriptor, WorkflowSpec};

/// Validated workflow catalog.
pub struct WorkflowRegistry {
    specs: HashMap<String, WorkflowSpec>,
    callables: CallableRegistry,
}

impl WorkflowRegistry {
    pub fn new(callables: CallableRegistry) -> Self {
        Self {
            specs: HashMap::new(),
            callables,
        }
    }

    /// Registry preloaded with the built-in workflows, validated against
    /// the agent catalog.
    pub fn builtin(providers: &Arc<ProviderRegistry>) -> Result<Self> {
        let mut registry = Self::new(CallableRegistry::builtin());
        for spec in builtin_workflows() {
            registry.register(spec, providers)?;
        }
        Ok(registry)
    }

    /// Validate and register one spec. Load-time failures are fatal: a
    /// workflow that cannot run must not appear in the catalog.
    pub fn register(
        &mut self,
        spec: WorkflowSpec,
        providers: &Arc<ProviderRegistry>,
    ) -> Result<()> {
        if spec.stages.is_empty() {
            return Err(WorkflowError::Validation(format!(
                "workflow '{}' has no stages",
                spec.key
            )));
        }
        for stage in &spec.stages {
            if stage.steps.is_empty() {
                return Err(WorkflowError::Validation(format!(
                    "stage '{}' of workflow '{}' has no steps",
                    stage.name, spec.key
                )));
            }
            if stage.mode == StageMode::Parallel && stage.steps.len() > 1 && stage.reducer.is_none()
            {
                return Err(WorkflowError::Validation(format!(
                    "parallel stage '{}' of workflow '{}' needs a reducer",
                    stage.name, spec.key
                )));
            }
            if let Some(reducer) = &stage.reducer {
                if self.callables.reducer(reducer).is_none() {
                    return Err(WorkflowError::Validation(format!(
                        "unknown reducer '{reducer}' in workflow '{}'",
                        spec.key
                    )));
                }
            }
            for step in &stage.steps {
                let descriptor =
                    providers
                        .resolve(Some(&step.agent_key))
                        .map_err(|_| WorkflowError::Validation(format!(
                            "workflow '{}' references unknown agent '{}'",
                            spec.key, step.agent_key
                        )))?;
                if !spec.allow_handoff_agents && !descriptor.handoffs.is_empty() {
                    return Err(WorkflowError::Validation(format!(
                        "workflow '{}' disallows handoffs but agent '{}' declares them",
                        spec.key, step.agent_key
                    )));
                }
                if let Some(guard) = &step.guard {
                    if self.callables.guard(guard).is_none() {
                        return Err(WorkflowError::Validation(format!(
                            "unknown guard '{guard}' in workflow '{}'",
                            spec.key
                        )));
                    }
                }
                if let Some(mapper) = &step.input_mapper {
                    if self.callables.mapper(mapper).is_none() {
                        return Err(WorkflowError::Validation(format!(
                            "unknown input mapper '{mapper}' in workflow '{}'",
                            spec.key
                        )));
                    }
                }
                if let Some(schema) = &step.output_schema {
                    if !schema.is_object() {
                        return Err(WorkflowError::Validation(format!(
                            "step '{}' of workflow '{}' has a non-object output schema",
                            step.display_name(),
                            spec.key
                        )));
                    }
                }
            }
        }
        if let Some(schema) = &spec.output_schema {
            if !schema.is_object() {
                return Err(WorkflowError::Validation(format!(
                    "workflow '{}' has a non-object output schema",
                    spec.key
                )));
            }
        }
        self.specs.insert(spec.key.clone(), spec);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&WorkflowSpec> {
        self.specs.get(key)
    }

    pub fn callables(&self) -> &CallableRegistry {
        &self.callables
    }

    pub fn list_descriptors(&self) -> Vec<WorkflowDescriptor> {
        let mut descriptors: Vec<WorkflowDescriptor> =
            self.specs.values().map(WorkflowSpec::descriptor).collect();
        descriptors.sort_by(|a, b| a.key.cmp(&b.key));
        descriptors
    }
}

/// Built-in workflow catalog.
fn builtin_workflows() -> Vec<WorkflowSpec> {
    use crate::spec::{StageSpec, StepSpec};

    vec![
        WorkflowSpec {
            key: "analysis_code".to_string(),
            display_name: "Analysis then code".to_string(),
            description: "Analyze the request, then produce code from the analysis".to_string(),
            default: true,
            allow_handoff_agents: false,
            stages: vec![
                StageSpec {
                    name: "analysis".to_string(),
                    mode: StageMode::Sequential,
                    reducer: None,
                    steps: vec![StepSpec {
                        name: Some("analysis".to_string()),
                        agent_key: "analysis".to_string(),
                        guard: None,
                        input_mapper: None,
                        max_turns: None,
                        output_schema: None,
                    }],
                },
                StageSpec {
                    name: "code".to_string(),
                    mode: StageMode::Sequential,
                    reducer: None,
                    steps: vec![StepSpec {
                        name: Some("code".to_string()),
                        agent_key: "code".to_string(),
                        guard: Some("skip_if_empty".to_string()),
                        input_mapper: Some("passthrough".to_string()),
                        max_turns: None,
                        output_schema: None,
                    }],
                },
            ],
            output_schema: None,
        },
        WorkflowSpec {
            key: "research_panel".to_string(),
            display_name: "Research panel".to_string(),
            description: "Fan the question out to research and analysis, then merge".to_string(),
            default: false,
            allow_handoff_agents: false,
            stages: vec![StageSpec {
                name: "panel".to_string(),
                mode: StageMode::Parallel,
                reducer: Some("join_outputs".to_string()),
                steps: vec![
                    StepSpec {
                        name: Some("research".to_string()),
                        agent_key: "research".to_string(),
                        guard: None,
                        input_mapper: None,
                        max_turns: None,
                        output_schema: None,
                    },
                    StepSpec {
                        name: Some("analysis".to_string()),
                        agent_key: "analysis".to_string(),
                        guard: None,
                        input_mapper: None,
                        max_turns: None,
                        output_schema: None,
                    },
                ],
            }],
            output_schema: None,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_providers::mock::MockProvider;

    fn providers() -> Arc<ProviderRegistry> {
        Arc::new(ProviderRegistry::new(Arc::new(MockProvider::new()), "triage"))
    }

    fn minimal_spec(key: &str, agent: &str) -> WorkflowSpec {
        use crate::spec::{StageSpec, StepSpec};
        WorkflowSpec {
            key: key.to_string(),
            display_name: key.to_string(),
            description: String::new(),
            default: false,
            allow_handoff_agents: false,
            stages: vec![StageSpec {
                name: "main".to_string(),
                mode: StageMode::Sequential,
                reducer: None,
                steps: vec![StepSpec {
                    name: None,
                    agent_key: agent.to_string(),
                    guard: None,
                    input_mapper: None,
                    max_turns: None,
                    output_schema: None,
                }],
            }],
            output_schema: None,
        }
    }

    #[test]
    fn builtins_load_and_list() {
        let registry = WorkflowRegistry::builtin(&providers()).unwrap();
        let keys: Vec<String> = registry
            .list_descriptors()
            .into_iter()
            .map(|d| d.key)
            .collect();
        assert_eq!(keys, vec!["analysis_code", "research_panel"]);
        assert!(registry.get("analysis_code").unwrap().default);
    }

    #[test]
    fn unknown_agent_fails_validation() {
        let mut registry = WorkflowRegistry::new(CallableRegistry::builtin());
        let err = registry
            .register(minimal_spec("wf", "ghost"), &providers())
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));
    }

    #[test]
    fn handoff_agents_are_rejected_when_disallowed() {
        let mut registry = WorkflowRegistry::new(CallableRegistry::builtin());
        // triage declares handoffs in the builtin agent catalog
        let err = registry
            .register(minimal_spec("wf", "triage"), &providers())
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));

        let mut allowed = minimal_spec("wf2", "triage");
        allowed.allow_handoff_agents = true;
        registry.register(allowed, &providers()).unwrap();
    }

    #[test]
    fn unknown_callables_fail_validation() {
        let mut registry = WorkflowRegistry::new(CallableRegistry::builtin());
        let mut spec = minimal_spec("wf", "analysis");
        spec.stages[0].steps[0].guard = Some("ghost_guard".to_string());
        assert!(registry.register(spec, &providers()).is_err());
    }

    #[test]
    fn parallel_stage_requires_a_reducer() {
        let mut registry = WorkflowRegistry::new(CallableRegistry::builtin());
        let mut spec = minimal_spec("wf", "analysis");
        spec.stages[0].mode = StageMode::Parallel;
        spec.stages[0].steps.push(crate::spec::StepSpec {
            name: None,
            agent_key: "code".to_string(),
            guard: None,
            input_mapper: None,
            max_turns: None,
            output_schema: None,
        });
        assert!(registry.register(spec, &providers()).is_err());
    }
}
