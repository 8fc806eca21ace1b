//! Stage name to executor lookup

use std::collections::HashMap;

use async_trait::async_trait;
use piped_model::StageStatus;
use tokio_util::sync::CancellationToken;

use super::{analysis, customsync, rollback, wait, waitapproval, Executor, Input};
use crate::errors::AgentError;

pub type Factory = Box<dyn Fn(Input) -> Box<dyn Executor> + Send + Sync>;

/// Wrap an executor constructor into a registry factory.
pub fn factory<E, F>(build: F) -> Factory
where
    E: Executor + 'static,
    F: Fn(Input) -> E + Send + Sync + 'static,
{
    Box::new(move |input: Input| -> Box<dyn Executor> { Box::new(build(input)) })
}

#[derive(Default)]
pub struct Registry {
    factories: HashMap<String, Factory>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every stage this agent can run on its own
    pub fn default_registry() -> Self {
        let mut registry = Self::new();
        let builtins = [
            (wait::STAGE_NAME, factory(wait::WaitExecutor::new)),
            (waitapproval::STAGE_NAME, factory(waitapproval::WaitApprovalExecutor::new)),
            (analysis::STAGE_NAME, factory(analysis::AnalysisExecutor::new)),
            (customsync::STAGE_NAME, factory(customsync::CustomSyncExecutor::new)),
            (rollback::STAGE_NAME, factory(rollback::RollbackExecutor::new)),
        ];
        for (name, factory) in builtins {
            registry.factories.insert(name.to_string(), factory);
        }
        registry
    }

    /// Add a factory for a stage name. Names can only be registered once.
    pub fn register(&mut self, stage_name: &str, factory: Factory) -> Result<(), AgentError> {
        if self.factories.contains_key(stage_name) {
            return Err(AgentError::ExecutorError(format!(
                "executor for stage {} was already registered",
                stage_name
            )));
        }
        self.factories.insert(stage_name.to_string(), factory);
        Ok(())
    }

    pub fn is_registered(&self, stage_name: &str) -> bool {
        self.factories.contains_key(stage_name)
    }

    /// Executor for the stage in `input`, or one that fails the stage when
    /// nothing is registered under its name.
    pub fn executor(&self, input: Input) -> Box<dyn Executor> {
        match self.factories.get(&input.stage.name) {
            Some(factory) => factory(input),
            None => Box::new(UnsupportedExecutor { input }),
        }
    }
}

struct UnsupportedExecutor {
    input: Input,
}

#[async_trait]
impl Executor for UnsupportedExecutor {
    async fn execute(&mut self, _cancel: CancellationToken) -> StageStatus {
        self.input.log_persister.errorf(format_args!(
            "Unsupported stage {}: no executor is registered for it on this piped",
            self.input.stage.name
        ));
        StageStatus::Failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::{harness, stage};

    struct Fixed(StageStatus);

    #[async_trait]
    impl Executor for Fixed {
        async fn execute(&mut self, _cancel: CancellationToken) -> StageStatus {
            self.0
        }
    }

    #[tokio::test]
    async fn test_unknown_stage_fails() {
        let h = harness(stage("K8S_CANARY_ROLLOUT", serde_json::Value::Null));
        let registry = Registry::default_registry();
        assert!(!registry.is_registered("K8S_CANARY_ROLLOUT"));

        let persister = h.input.log_persister.clone();
        let status = registry.executor(h.input).execute(CancellationToken::new()).await;
        assert_eq!(status, StageStatus::Failure);
        assert!(persister.logs()[0].starts_with("Unsupported stage K8S_CANARY_ROLLOUT"));
    }

    #[tokio::test]
    async fn test_register_platform_stage() {
        let mut registry = Registry::default_registry();
        registry
            .register("K8S_SYNC", factory(|_| Fixed(StageStatus::Success)))
            .unwrap();
        assert!(registry
            .register("K8S_SYNC", factory(|_| Fixed(StageStatus::Failure)))
            .is_err());
        assert!(registry.register("WAIT", factory(|_| Fixed(StageStatus::Failure))).is_err());

        let h = harness(stage("K8S_SYNC", serde_json::Value::Null));
        let status = registry.executor(h.input).execute(CancellationToken::new()).await;
        assert_eq!(status, StageStatus::Success);
    }
}
