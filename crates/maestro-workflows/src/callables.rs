//! Registered guard/mapper/reducer callables.
//!
//! A startup table from name to function pointer keeps workflow specs
//! pure data; validation rejects unknown names at load time.

use std::collections::HashMap;

/// A completed step as seen by later guards, mappers, and reducers.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub step_name: String,
    pub agent_key: String,
    pub output: String,
}

pub type GuardFn = fn(&str, &[StepRecord]) -> bool;
pub type MapperFn = fn(&str, &[StepRecord]) -> String;
pub type ReducerFn = fn(&[String], &[StepRecord]) -> String;

pub struct CallableRegistry {
    guards: HashMap<String, GuardFn>,
    mappers: HashMap<String, MapperFn>,
    reducers: HashMap<String, ReducerFn>,
}

impl CallableRegistry {
    pub fn new() -> Self {
        Self {
            guards: HashMap::new(),
            mappers: HashMap::new(),
            reducers: HashMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register_guard("always", |_, _| true);
        registry.register_guard("skip_if_empty", |input, _| !input.trim().is_empty());
        registry.register_mapper("passthrough", |input, _| input.to_string());
        registry.register_mapper("with_prior_outputs", |input, prior| {
            if prior.is_empty() {
                return input.to_string();
            }
            let context: Vec<String> = prior
                .iter()
                .map(|s| format!("[{}] {}", s.step_name, s.output))
                .collect();
            format!("{input}\n\nEarlier results:\n{}", context.join("\n"))
        });
        registry.register_reducer("join_outputs", |outputs, _| outputs.join("\n\n"));
        registry.register_reducer("first_output", |outputs, _| {
            outputs.first().cloned().unwrap_or_default()
        });
        registry.register_reducer("last_output", |outputs, _| {
            outputs.last().cloned().unwrap_or_default()
        });
        registry
    }

    pub fn register_guard(&mut self, name: &str, f: GuardFn) {
        self.guards.insert(name.to_string(), f);
    }

    pub fn register_mapper(&mut self, name: &str, f: MapperFn) {
        self.mappers.insert(name.to_string(), f);
    }

    pub fn register_reducer(&mut self, name: &str, f: ReducerFn) {
        self.reducers.insert(name.to_string(), f);
    }

    pub fn guard(&self, name: &str) -> Option<GuardFn> {
        self.guards.get(name).copied()
    }

    pub fn mapper(&self, name: &str) -> Option<MapperFn> {
        self.mappers.get(name).copied()
    }

    pub fn reducer(&self, name: &str) -> Option<ReducerFn> {
        self.reducers.get(name).copied()
    }
}

impl Default for CallableRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_callables_resolve() {
        let r = CallableRegistry::builtin();
        assert!(r.guard("skip_if_empty").is_some());
        assert!(r.mapper("passthrough").is_some());
        assert!(r.reducer("join_outputs").is_some());
        assert!(r.guard("nope").is_none());
    }

    #[test]
    fn skip_if_empty_skips_blank_input() {
        let r = CallableRegistry::builtin();
        let guard = r.guard("skip_if_empty").unwrap();
        assert!(!guard("   ", &[]));
        assert!(guard("go", &[]));
    }

    #[test]
    fn join_reducer_combines_branch_outputs() {
        let r = CallableRegistry::builtin();
        let reducer = r.reducer("join_outputs").unwrap();
        assert_eq!(
            reducer(&["a".to_string(), "b".to_string()], &[]),
            "a\n\nb"
        );
    }
}
