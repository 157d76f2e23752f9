use std::sync::Arc;

use labelsquor_core::{OrchestratorConfig, Stage};
use labelsquor_store::WorkItemStore;

use crate::error::OrchestratorError;
use crate::events::EventSubscriber;
use crate::handler::{HandlerRegistry, StageHandler};
use crate::orchestrator::Orchestrator;
use crate::quota::QuotaManager;

/// Fluent builder for constructing an [`Orchestrator`].
///
/// A store and a handler for every pipeline stage must be supplied; the
/// configuration defaults are usable as-is and subscribers are optional.
pub struct OrchestratorBuilder {
    store: Option<Arc<dyn WorkItemStore>>,
    config: OrchestratorConfig,
    registry: HandlerRegistry,
    subscribers: Vec<Arc<dyn EventSubscriber>>,
}

impl OrchestratorBuilder {
    /// Create a builder with default configuration and no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: None,
            config: OrchestratorConfig::default(),
            registry: HandlerRegistry::new(),
            subscribers: Vec::new(),
        }
    }

    /// Set the durable store backend.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn WorkItemStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the configuration.
    #[must_use]
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Register the handler for one stage.
    #[must_use]
    pub fn handler(mut self, stage: Stage, handler: Arc<dyn StageHandler>) -> Self {
        self.registry.register(stage, handler);
        self
    }

    /// Subscribe to delivered events.
    #[must_use]
    pub fn subscriber(mut self, subscriber: Arc<dyn EventSubscriber>) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    /// Validate the wiring and build the engine facade.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Configuration`] when the store is
    /// missing, the configuration is invalid, or any pipeline stage has no
    /// handler.
    pub fn build(self) -> Result<Orchestrator, OrchestratorError> {
        let store = self
            .store
            .ok_or_else(|| OrchestratorError::Configuration("a store is required".into()))?;

        self.config
            .validate()
            .map_err(OrchestratorError::Configuration)?;

        if !self.registry.is_complete() {
            let missing: Vec<String> = self
                .registry
                .missing_stages()
                .iter()
                .map(ToString::to_string)
                .collect();
            return Err(OrchestratorError::Configuration(format!(
                "no handler registered for stages: {}",
                missing.join(", ")
            )));
        }

        let config = Arc::new(self.config);
        let quota = Arc::new(QuotaManager::new(store.clone(), config.clone()));
        Ok(Orchestrator::new(
            store,
            Arc::new(self.registry),
            self.subscribers,
            quota,
            config,
        ))
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use labelsquor_core::{StageError, StageOutcome, WorkItem};
    use labelsquor_store_memory::MemoryWorkItemStore;

    use crate::handler::StageContext;

    struct NoopHandler;

    #[async_trait]
    impl StageHandler for NoopHandler {
        async fn execute(
            &self,
            _item: &WorkItem,
            _ctx: &StageContext,
        ) -> Result<StageOutcome, StageError> {
            Ok(StageOutcome::Done {
                summary: serde_json::Value::Null,
            })
        }
    }

    #[test]
    fn build_requires_store() {
        let err = OrchestratorBuilder::new().build().unwrap_err();
        assert!(matches!(err, OrchestratorError::Configuration(_)));
    }

    #[test]
    fn build_requires_complete_registry() {
        let builder = OrchestratorBuilder::new()
            .store(Arc::new(MemoryWorkItemStore::new()))
            .handler(Stage::Discovery, Arc::new(NoopHandler));
        let err = builder.build().unwrap_err();
        match err {
            OrchestratorError::Configuration(msg) => {
                assert!(msg.contains("image_fetch"), "missing stages listed: {msg}");
            }
            other => panic!("expected Configuration, got {other:?}"),
        }
    }

    #[test]
    fn build_rejects_invalid_config() {
        let mut builder = OrchestratorBuilder::new().store(Arc::new(MemoryWorkItemStore::new()));
        for stage in Stage::ALL {
            builder = builder.handler(stage, Arc::new(NoopHandler));
        }
        let err = builder
            .config(OrchestratorConfig {
                num_workers: 0,
                ..OrchestratorConfig::default()
            })
            .build()
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Configuration(_)));
    }

    #[test]
    fn build_succeeds_with_full_wiring() {
        let mut builder = OrchestratorBuilder::new().store(Arc::new(MemoryWorkItemStore::new()));
        for stage in Stage::ALL {
            builder = builder.handler(stage, Arc::new(NoopHandler));
        }
        assert!(builder.build().is_ok());
    }
}
