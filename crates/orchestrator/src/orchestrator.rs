use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use labelsquor_core::{
    DeadLetterEntry, OrchestratorConfig, Transition, WorkItem, WorkState,
};
use labelsquor_store::{
    FieldUpdate, ItemFilter, TransitionChanges, TransitionOutcome, TransitionRequest,
    WorkItemStore,
};

use crate::error::OrchestratorError;
use crate::events::EventSubscriber;
use crate::handler::HandlerRegistry;
use crate::metrics::{MetricsSnapshot, OrchestratorMetrics};
use crate::pool::WorkerPool;
use crate::quota::QuotaManager;
use crate::views::{EngineStats, collect_stats};

/// Actor recorded on transitions issued through the ingress API.
const API_ACTOR: &str = "api";

/// The engine facade: ingress operations for producers and operators,
/// read-only observability, and the entry point for starting the worker
/// pool. All state mutation funnels through the store's
/// compare-and-transition primitive.
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn WorkItemStore>,
    registry: Arc<HandlerRegistry>,
    subscribers: Vec<Arc<dyn EventSubscriber>>,
    quota: Arc<QuotaManager>,
    config: Arc<OrchestratorConfig>,
    metrics: Arc<OrchestratorMetrics>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub(crate) fn new(
        store: Arc<dyn WorkItemStore>,
        registry: Arc<HandlerRegistry>,
        subscribers: Vec<Arc<dyn EventSubscriber>>,
        quota: Arc<QuotaManager>,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        Self {
            store,
            registry,
            subscribers,
            quota,
            config,
            metrics: Arc::new(OrchestratorMetrics::default()),
        }
    }

    /// Start the worker pool, sweeper, and event delivery loop.
    #[must_use]
    pub fn start(&self) -> WorkerPool {
        WorkerPool::spawn(
            self.store.clone(),
            self.registry.clone(),
            self.subscribers.clone(),
            self.quota.clone(),
            self.config.clone(),
            self.metrics.clone(),
        )
    }

    /// The quota manager, for stage handlers and operators.
    #[must_use]
    pub fn quota(&self) -> Arc<QuotaManager> {
        self.quota.clone()
    }

    /// Point-in-time engine counters.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    // -- Ingress -------------------------------------------------------------

    /// Insert a new work item and make it schedulable.
    #[instrument(name = "orchestrator.enqueue", skip_all)]
    pub async fn enqueue(
        &self,
        payload: serde_json::Value,
        priority: i32,
        metadata: serde_json::Value,
    ) -> Result<WorkItem, OrchestratorError> {
        let id = uuid::Uuid::now_v7().to_string();
        let item = WorkItem::new(&id, payload, priority, metadata, Utc::now());
        self.store.insert(&item).await?;

        let outcome = self
            .store
            .transition(TransitionRequest::new(
                &id,
                0,
                WorkState::Created,
                WorkState::Ready,
                "enqueued",
                API_ACTOR,
            ))
            .await?;
        match outcome {
            TransitionOutcome::Applied(item) => {
                info!(item_id = %id, priority, "work item enqueued");
                Ok(*item)
            }
            TransitionOutcome::Conflict(_) => Err(OrchestratorError::Conflict(id)),
        }
    }

    /// Cancel an item.
    ///
    /// Parked items transition to `Cancelled` directly. A `Running` item
    /// gets a cancellation request that its worker observes at the next
    /// stage boundary; terminal items are refused.
    #[instrument(name = "orchestrator.cancel", skip(self))]
    pub async fn cancel(
        &self,
        id: &str,
        reason: &str,
    ) -> Result<WorkItem, OrchestratorError> {
        let item = self.store.get(id).await?;

        if item.state == WorkState::Running {
            let flagged = self.store.request_cancel(id).await?;
            info!(item_id = %id, "cancellation requested for running item");
            return Ok(flagged);
        }

        let outcome = self
            .store
            .transition(
                TransitionRequest::new(
                    id,
                    item.version,
                    item.state,
                    WorkState::Cancelled,
                    reason,
                    API_ACTOR,
                )
                .with_changes(TransitionChanges {
                    next_attempt_at: FieldUpdate::Clear,
                    ..TransitionChanges::default()
                }),
            )
            .await?;
        match outcome {
            TransitionOutcome::Applied(item) => {
                self.metrics.incr(&self.metrics.items_cancelled);
                Ok(*item)
            }
            TransitionOutcome::Conflict(_) => Err(OrchestratorError::Conflict(id.to_owned())),
        }
    }

    /// Manually resume a `Failed` or `Suspended` item.
    #[instrument(name = "orchestrator.retry", skip(self))]
    pub async fn retry(&self, id: &str) -> Result<WorkItem, OrchestratorError> {
        let item = self.store.get(id).await?;
        if !matches!(item.state, WorkState::Failed | WorkState::Suspended) {
            return Err(OrchestratorError::IllegalTransition {
                from: item.state,
                to: WorkState::Ready,
            });
        }
        self.resume_to_ready(&item, "manual_retry").await
    }

    /// Park a `Failed` item for manual inspection.
    #[instrument(name = "orchestrator.suspend", skip(self))]
    pub async fn suspend(
        &self,
        id: &str,
        reason: &str,
    ) -> Result<WorkItem, OrchestratorError> {
        let item = self.store.get(id).await?;
        let outcome = self
            .store
            .transition(TransitionRequest::new(
                id,
                item.version,
                WorkState::Failed,
                WorkState::Suspended,
                reason,
                API_ACTOR,
            ))
            .await?;
        match outcome {
            TransitionOutcome::Applied(item) => Ok(*item),
            TransitionOutcome::Conflict(_) => Err(OrchestratorError::Conflict(id.to_owned())),
        }
    }

    /// Wake an item parked in `Waiting` by an external signal.
    #[instrument(name = "orchestrator.wake", skip(self))]
    pub async fn wake(&self, id: &str) -> Result<WorkItem, OrchestratorError> {
        let item = self.store.get(id).await?;
        if item.state != WorkState::Waiting {
            return Err(OrchestratorError::IllegalTransition {
                from: item.state,
                to: WorkState::Ready,
            });
        }
        self.resume_to_ready(&item, "external_wake").await
    }

    async fn resume_to_ready(
        &self,
        item: &WorkItem,
        reason: &str,
    ) -> Result<WorkItem, OrchestratorError> {
        let outcome = self
            .store
            .transition(
                TransitionRequest::new(
                    &item.id,
                    item.version,
                    item.state,
                    WorkState::Ready,
                    reason,
                    API_ACTOR,
                )
                .with_changes(TransitionChanges {
                    next_attempt_at: FieldUpdate::Clear,
                    ..TransitionChanges::default()
                }),
            )
            .await?;
        match outcome {
            TransitionOutcome::Applied(item) => Ok(*item),
            TransitionOutcome::Conflict(_) => {
                Err(OrchestratorError::Conflict(item.id.clone()))
            }
        }
    }

    // -- Observability -------------------------------------------------------

    /// Current snapshot of one item.
    pub async fn get(&self, id: &str) -> Result<WorkItem, OrchestratorError> {
        Ok(self.store.get(id).await?)
    }

    /// Items matching the filter.
    pub async fn list(&self, filter: &ItemFilter) -> Result<Vec<WorkItem>, OrchestratorError> {
        Ok(self.store.list(filter).await?)
    }

    /// Full ordered transition history of one item.
    pub async fn history(&self, id: &str) -> Result<Vec<Transition>, OrchestratorError> {
        // Surface NotFound for unknown ids rather than an empty history.
        self.store.get(id).await?;
        Ok(self.store.history(id).await?)
    }

    /// Dead-lettered items, newest first.
    pub async fn dead_letters(
        &self,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, OrchestratorError> {
        Ok(self.store.dead_letters(limit).await?)
    }

    /// Aggregate stats over a time range for the given services.
    pub async fn stats(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        services: &[String],
    ) -> Result<EngineStats, OrchestratorError> {
        Ok(collect_stats(&self.store, from, to, services).await?)
    }
}
