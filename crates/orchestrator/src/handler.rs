use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use labelsquor_core::{Stage, StageError, StageOutcome, WorkItem};

use crate::quota::QuotaManager;

/// Execution context handed to a stage handler.
///
/// Gives the handler its deadline, the quota manager for pre-call `check` /
/// post-call `record`, and the cancellation flag captured at claim time.
/// The work-item snapshot itself (including prior `partial_results`) is the
/// other argument of [`StageHandler::execute`].
pub struct StageContext {
    /// The item being processed.
    pub work_item_id: String,
    /// The stage being executed.
    pub stage: Stage,
    /// Hard deadline; the executor abandons the stage past it, so handlers
    /// should pass it to their own I/O.
    pub deadline: DateTime<Utc>,
    /// Quota manager for external-service calls.
    pub quota: Arc<QuotaManager>,
}

impl StageContext {
    /// Remaining time before the stage deadline.
    #[must_use]
    pub fn remaining(&self) -> chrono::Duration {
        self.deadline - Utc::now()
    }
}

/// A handler for one pipeline stage, implemented by external collaborators
/// (crawler adapters, the vision-model client, the scorer, the indexer).
///
/// Handlers MUST be idempotent with respect to their stage key: the engine
/// provides at-least-once execution, so a stage may run again after a crash
/// or an expired lease. Raised [`StageError`]s are classified at the
/// executor boundary; anything else the handler returns flows through as a
/// normalized [`StageOutcome`].
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Execute the stage against a read-only item snapshot.
    async fn execute(
        &self,
        item: &WorkItem,
        ctx: &StageContext,
    ) -> Result<StageOutcome, StageError>;
}

/// Closed registry mapping each [`Stage`] to its handler.
///
/// The set of stages is a fixed enum, so registration is checked for
/// completeness at engine build time; there is no runtime discovery.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<Stage, Arc<dyn StageHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for a stage, replacing any previous one.
    pub fn register(&mut self, stage: Stage, handler: Arc<dyn StageHandler>) {
        self.handlers.insert(stage, handler);
    }

    /// Look up the handler for a stage.
    #[must_use]
    pub fn get(&self, stage: Stage) -> Option<Arc<dyn StageHandler>> {
        self.handlers.get(&stage).cloned()
    }

    /// Stages with no registered handler.
    #[must_use]
    pub fn missing_stages(&self) -> Vec<Stage> {
        Stage::ALL
            .into_iter()
            .filter(|stage| !self.handlers.contains_key(stage))
            .collect()
    }

    /// Whether every pipeline stage has a handler.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.missing_stages().is_empty()
    }
}
