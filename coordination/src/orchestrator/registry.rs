//! Step registry and named pipelines.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

use super::OrchestratorError;
use crate::contracts::Step;

/// Steps resolved for one run, in order.
pub type ResolvedPipeline = Vec<(String, Arc<dyn Step>)>;

/// Registered steps and the pipelines built from them.
#[derive(Default)]
pub struct StepRegistry {
    steps: HashMap<String, Arc<dyn Step>>,
    pipelines: BTreeMap<String, Vec<String>>,
}

impl StepRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step under `name`. Names are unique.
    pub fn register(&mut self, name: &str, step: Arc<dyn Step>) -> Result<(), OrchestratorError> {
        if name.trim().is_empty() {
            return Err(OrchestratorError::InvalidName);
        }
        if self.steps.contains_key(name) {
            return Err(OrchestratorError::DuplicateStep(name.to_string()));
        }
        debug!(step = name, "step registered");
        self.steps.insert(name.to_string(), step);
        Ok(())
    }

    /// Step registered under `name`.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Step>> {
        self.steps.get(name).cloned()
    }

    /// Registered step names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.steps.keys().cloned().collect();
        names.sort();
        names
    }

    /// Define (or replace) a named pipeline.
    ///
    /// Every step must be registered, appear once, and come after the
    /// steps it depends on.
    pub fn define_pipeline<S: AsRef<str>>(
        &mut self,
        name: &str,
        steps: &[S],
    ) -> Result<(), OrchestratorError> {
        if name.trim().is_empty() {
            return Err(OrchestratorError::InvalidName);
        }
        let steps: Vec<String> = steps.iter().map(|s| s.as_ref().to_string()).collect();
        self.resolve(&steps)?;
        debug!(pipeline = name, steps = ?steps, "pipeline defined");
        self.pipelines.insert(name.to_string(), steps);
        Ok(())
    }

    /// Steps of a named pipeline.
    pub fn pipeline(&self, name: &str) -> Option<&[String]> {
        self.pipelines.get(name).map(Vec::as_slice)
    }

    /// Names of defined pipelines, sorted.
    pub fn pipelines(&self) -> Vec<String> {
        self.pipelines.keys().cloned().collect()
    }

    /// Validate an ordered list of step names and look the steps up.
    pub fn resolve<S: AsRef<str>>(&self, names: &[S]) -> Result<ResolvedPipeline, OrchestratorError> {
        if names.is_empty() {
            return Err(OrchestratorError::EmptyPipeline);
        }

        let mut resolved: ResolvedPipeline = Vec::with_capacity(names.len());
        for name in names.iter().map(AsRef::as_ref) {
            let step = self
                .get(name)
                .ok_or_else(|| OrchestratorError::UnknownStep(name.to_string()))?;
            if resolved.iter().any(|(n, _)| n == name) {
                return Err(OrchestratorError::RepeatedStep(name.to_string()));
            }
            resolved.push((name.to_string(), step));
        }

        for (position, (name, step)) in resolved.iter().enumerate() {
            for dependency in step.dependencies() {
                match resolved.iter().position(|(n, _)| n == dependency) {
                    Some(at) if at < position => {}
                    Some(_) => {
                        return Err(OrchestratorError::DependencyOrder {
                            step: name.clone(),
                            dependency: dependency.to_string(),
                        })
                    }
                    None => {
                        return Err(OrchestratorError::MissingDependency {
                            step: name.clone(),
                            dependency: dependency.to_string(),
                        })
                    }
                }
            }
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use crate::contracts::{StepOutcome, StepResult};
    use async_trait::async_trait;

    struct Named {
        name: &'static str,
        deps: &'static [&'static str],
    }

    #[async_trait]
    impl Step for Named {
        fn name(&self) -> &str {
            self.name
        }

        fn dependencies(&self) -> &[&'static str] {
            self.deps
        }

        async fn run(&self, _ctx: &mut ExecutionContext) -> StepResult {
            Ok(StepOutcome::idle())
        }
    }

    fn registry() -> StepRegistry {
        let mut reg = StepRegistry::new();
        reg.register("a", Arc::new(Named { name: "a", deps: &[] })).unwrap();
        reg.register("b", Arc::new(Named { name: "b", deps: &["a"] })).unwrap();
        reg.register("c", Arc::new(Named { name: "c", deps: &["a", "b"] })).unwrap();
        reg
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut reg = registry();
        let err = reg
            .register("a", Arc::new(Named { name: "a", deps: &[] }))
            .unwrap_err();
        assert_eq!(err, OrchestratorError::DuplicateStep("a".to_string()));
        assert_eq!(reg.names(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_define_pipeline_in_dependency_order() {
        let mut reg = registry();
        reg.define_pipeline("full", &["a", "b", "c"]).unwrap();
        assert_eq!(reg.pipeline("full").unwrap().len(), 3);
    }

    #[test]
    fn test_define_pipeline_rejects_bad_order() {
        let mut reg = registry();
        assert_eq!(
            reg.define_pipeline("bad", &["b", "a"]),
            Err(OrchestratorError::DependencyOrder {
                step: "b".to_string(),
                dependency: "a".to_string()
            })
        );
        assert_eq!(
            reg.define_pipeline("partial", &["b"]),
            Err(OrchestratorError::MissingDependency {
                step: "b".to_string(),
                dependency: "a".to_string()
            })
        );
        assert_eq!(
            reg.define_pipeline("unknown", &["a", "zzz"]),
            Err(OrchestratorError::UnknownStep("zzz".to_string()))
        );
        assert_eq!(
            reg.define_pipeline("twice", &["a", "a"]),
            Err(OrchestratorError::RepeatedStep("a".to_string()))
        );
        let none: [&str; 0] = [];
        assert_eq!(reg.define_pipeline("empty", &none), Err(OrchestratorError::EmptyPipeline));
        assert!(reg.pipelines().is_empty());
    }
}
