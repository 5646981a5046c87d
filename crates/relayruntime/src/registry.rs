use relaycore::{DispatchError, StepExecutor, StepKind, WorkflowStep};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Metadata about a registered step kind
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorInfo {
    pub kind: StepKind,
    pub description: String,
}

/// Registry of available step executors, one per kind
pub struct ExecutorRegistry {
    executors: HashMap<StepKind, Arc<dyn StepExecutor>>,
    use_mock: bool,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
            use_mock: false,
        }
    }

    /// Route untagged steps to the mock executor.
    pub fn set_use_mock(&mut self, use_mock: bool) {
        self.use_mock = use_mock;
    }

    pub fn use_mock(&self) -> bool {
        self.use_mock
    }

    /// Register an executor under the kind it declares
    pub fn register(&mut self, executor: Arc<dyn StepExecutor>) {
        let kind = executor.kind();
        tracing::info!("Registering step executor: {}", kind);
        self.executors.insert(kind, executor);
    }

    /// Kind a step dispatches as. An explicit tag always wins.
    pub fn effective_kind(&self, step: &WorkflowStep) -> StepKind {
        match step.kind {
            Some(kind) => kind,
            None if self.use_mock => StepKind::Mock,
            None => StepKind::DelegatedAgent,
        }
    }

    /// Find the executor for a step
    pub fn resolve(&self, step: &WorkflowStep) -> Result<Arc<dyn StepExecutor>, DispatchError> {
        let kind = self.effective_kind(step);
        match self.executors.get(&kind) {
            Some(executor) if executor.can_handle(step) => Ok(Arc::clone(executor)),
            _ => Err(DispatchError::UnsupportedStepKind {
                step_id: step.id.clone(),
                kind: kind.to_string(),
                registered: self
                    .registered_kinds()
                    .into_iter()
                    .map(|k| k.to_string())
                    .collect(),
            }),
        }
    }

    pub fn get(&self, kind: StepKind) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(&kind).cloned()
    }

    /// Registered kinds, in declaration order
    pub fn registered_kinds(&self) -> Vec<StepKind> {
        let mut kinds: Vec<StepKind> = self.executors.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn list_executors(&self) -> Vec<ExecutorInfo> {
        self.registered_kinds()
            .into_iter()
            .filter_map(|kind| {
                self.executors.get(&kind).map(|e| ExecutorInfo {
                    kind,
                    description: e.description().to_string(),
                })
            })
            .collect()
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relaycore::{StepContext, StepError, StepResult};

    struct Fixed(StepKind);

    #[async_trait]
    impl StepExecutor for Fixed {
        fn kind(&self) -> StepKind {
            self.0
        }

        fn can_handle(&self, step: &WorkflowStep) -> bool {
            step.config.get_bool("refuse") != Some(true)
        }

        async fn execute(&self, step: &WorkflowStep, _ctx: StepContext) -> Result<StepResult, StepError> {
            Ok(StepResult::completed(step.id.clone(), "ok"))
        }
    }

    #[test]
    fn untagged_steps_default_by_mock_flag() {
        let mut registry = ExecutorRegistry::new();
        let step = WorkflowStep::new("a", "do it").with_role("writer");

        assert_eq!(registry.effective_kind(&step), StepKind::DelegatedAgent);
        registry.set_use_mock(true);
        assert_eq!(registry.effective_kind(&step), StepKind::Mock);

        let tagged = step.with_kind(StepKind::ScriptedOperator);
        assert_eq!(registry.effective_kind(&tagged), StepKind::ScriptedOperator);
    }

    #[test]
    fn unsupported_kind_lists_registered_kinds() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(Fixed(StepKind::Mock)));
        registry.register(Arc::new(Fixed(StepKind::ScriptedOperator)));

        let step = WorkflowStep::new("a", "do it")
            .with_role("writer")
            .with_kind(StepKind::ExternalCallback);
        match registry.resolve(&step) {
            Err(DispatchError::UnsupportedStepKind { step_id, kind, registered }) => {
                assert_eq!(step_id, "a");
                assert_eq!(kind, "external_callback");
                assert_eq!(registered, vec!["mock", "scripted_operator"]);
            }
            Ok(_) => panic!("expected dispatch error"),
        }
    }

    #[test]
    fn executor_may_refuse_a_step() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(Fixed(StepKind::Mock)));

        let step = WorkflowStep::new("a", "do it")
            .with_kind(StepKind::Mock)
            .with_config("refuse", true);
        assert!(registry.resolve(&step).is_err());
    }
}
