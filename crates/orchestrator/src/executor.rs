use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, instrument, warn};

use labelsquor_core::{
    Event, EventType, FailureClass, Metric, MetricKind, StageError, StageOutcome, WorkItem,
};
use labelsquor_store::WorkItemStore;

use crate::handler::{HandlerRegistry, StageContext};
use crate::metrics::OrchestratorMetrics;
use crate::quota::QuotaManager;

/// Dispatches to the handler for an item's current stage and normalizes the
/// result into a [`StageOutcome`].
///
/// The executor owns the per-stage timeout and the error-classification
/// boundary: raised [`StageError`]s map to their failure class, a timeout
/// becomes a transient failure, and a quota signal becomes the dedicated
/// quota outcome. Stage lifecycle events and duration metrics are recorded
/// here; they are observability writes, so a store hiccup degrades to a
/// warning rather than failing the stage.
pub struct StageExecutor {
    store: Arc<dyn WorkItemStore>,
    metrics: Arc<OrchestratorMetrics>,
    stage_timeout: Duration,
}

impl StageExecutor {
    /// Create an executor with the given per-stage timeout.
    #[must_use]
    pub fn new(
        store: Arc<dyn WorkItemStore>,
        metrics: Arc<OrchestratorMetrics>,
        stage_timeout: Duration,
    ) -> Self {
        Self {
            store,
            metrics,
            stage_timeout,
        }
    }

    async fn append_event(&self, event: Event) {
        if let Err(e) = self.store.append_event(event).await {
            warn!(error = %e, "failed to append stage event");
        }
    }

    /// Run the item's current stage to a normalized outcome.
    #[instrument(name = "stage.execute", skip_all, fields(item_id = %item.id, stage = %item.stage))]
    pub async fn execute(
        &self,
        item: &WorkItem,
        registry: &HandlerRegistry,
        quota: Arc<QuotaManager>,
    ) -> StageOutcome {
        let stage = item.stage;
        let started = Instant::now();
        self.metrics.incr(&self.metrics.stages_executed);

        self.append_event(Event::new(
            &item.id,
            EventType::StageStarted,
            serde_json::json!({"stage": stage}),
            Utc::now(),
        ))
        .await;

        let outcome = match registry.get(stage) {
            Some(handler) => {
                let ctx = StageContext {
                    work_item_id: item.id.clone(),
                    stage,
                    deadline: Utc::now()
                        + chrono::Duration::from_std(self.stage_timeout)
                            .unwrap_or_else(|_| chrono::Duration::seconds(300)),
                    quota,
                };
                match tokio::time::timeout(self.stage_timeout, handler.execute(item, &ctx)).await
                {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(err)) => Self::classify(err),
                    Err(_elapsed) => {
                        warn!(timeout = ?self.stage_timeout, "stage timed out");
                        StageOutcome::Failed {
                            class: FailureClass::Transient,
                            reason: "stage timeout".into(),
                            details: serde_json::json!({
                                "timeout_seconds": self.stage_timeout.as_secs(),
                            }),
                            retry_at: None,
                        }
                    }
                }
            }
            // A missing handler is a wiring defect, not a flaky call.
            None => StageOutcome::Failed {
                class: FailureClass::Fatal,
                reason: format!("no handler registered for stage {stage}"),
                details: serde_json::Value::Null,
                retry_at: None,
            },
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
        if let Err(e) = self
            .store
            .record_metric(Metric::new(
                Some(item.id.clone()),
                MetricKind::StageDurationMs,
                stage.as_str(),
                elapsed_ms,
                Utc::now(),
            ))
            .await
        {
            warn!(error = %e, "failed to record stage duration metric");
        }

        match &outcome {
            StageOutcome::Done { .. } | StageOutcome::Partial { .. } => {
                debug!(elapsed_ms, "stage completed");
                self.append_event(Event::new(
                    &item.id,
                    EventType::StageCompleted,
                    serde_json::json!({"stage": stage, "duration_ms": elapsed_ms}),
                    Utc::now(),
                ))
                .await;
            }
            StageOutcome::Failed { class, reason, .. } => {
                self.metrics.incr(&self.metrics.stages_failed);
                self.append_event(Event::new(
                    &item.id,
                    EventType::StageFailed,
                    serde_json::json!({"stage": stage, "class": class, "reason": reason}),
                    Utc::now(),
                ))
                .await;
                if let Err(e) = self
                    .store
                    .record_metric(Metric::new(
                        Some(item.id.clone()),
                        MetricKind::Error,
                        class.as_str(),
                        1.0,
                        Utc::now(),
                    ))
                    .await
                {
                    warn!(error = %e, "failed to record error metric");
                }
            }
            StageOutcome::QuotaExceeded {
                service, reset_at, ..
            } => {
                self.append_event(Event::new(
                    &item.id,
                    EventType::QuotaExceeded,
                    serde_json::json!({
                        "stage": stage,
                        "service": service,
                        "reset_at": reset_at,
                    }),
                    Utc::now(),
                ))
                .await;
            }
        }

        outcome
    }

    fn classify(err: StageError) -> StageOutcome {
        match err {
            StageError::QuotaExhausted { service, reset_at } => StageOutcome::QuotaExceeded {
                service,
                reset_at,
                partial: None,
            },
            // An external reset hint (e.g. Retry-After) rides along so the
            // retry policy can schedule at the reported instant.
            StageError::RateLimited { message, reset_at } => StageOutcome::Failed {
                class: FailureClass::RateLimit,
                reason: format!("rate limited: {message}"),
                details: serde_json::Value::Null,
                retry_at: reset_at,
            },
            other => {
                let reason = other.to_string();
                // `class()` is None only for QuotaExhausted, handled above.
                let class = other.class().unwrap_or(FailureClass::Transient);
                StageOutcome::Failed {
                    class,
                    reason,
                    details: serde_json::Value::Null,
                    retry_at: None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use labelsquor_core::{OrchestratorConfig, Stage};

    use crate::handler::StageHandler;

    struct ScriptedHandler {
        result: fn() -> Result<StageOutcome, StageError>,
    }

    #[async_trait]
    impl StageHandler for ScriptedHandler {
        async fn execute(
            &self,
            _item: &WorkItem,
            _ctx: &StageContext,
        ) -> Result<StageOutcome, StageError> {
            (self.result)()
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl StageHandler for SlowHandler {
        async fn execute(
            &self,
            _item: &WorkItem,
            _ctx: &StageContext,
        ) -> Result<StageOutcome, StageError> {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            Ok(StageOutcome::Done {
                summary: serde_json::Value::Null,
            })
        }
    }

    fn executor(timeout: Duration) -> (StageExecutor, Arc<QuotaManager>) {
        let store: Arc<dyn labelsquor_store::WorkItemStore> =
            Arc::new(labelsquor_store_memory::MemoryWorkItemStore::new());
        let metrics = Arc::new(OrchestratorMetrics::default());
        let quota = Arc::new(QuotaManager::new(
            store.clone(),
            Arc::new(OrchestratorConfig::default()),
        ));
        (StageExecutor::new(store, metrics, timeout), quota)
    }

    fn item() -> WorkItem {
        WorkItem::new(
            "wi-exec",
            serde_json::Value::Null,
            0,
            serde_json::Value::Null,
            Utc::now(),
        )
    }

    fn registry_with(result: fn() -> Result<StageOutcome, StageError>) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register(Stage::Discovery, Arc::new(ScriptedHandler { result }));
        registry
    }

    #[tokio::test]
    async fn done_outcome_passes_through() {
        let (executor, quota) = executor(Duration::from_secs(5));
        let registry = registry_with(|| {
            Ok(StageOutcome::Done {
                summary: serde_json::json!({"pages": 1}),
            })
        });
        let outcome = executor.execute(&item(), &registry, quota).await;
        assert!(matches!(outcome, StageOutcome::Done { .. }));
    }

    #[tokio::test]
    async fn raised_validation_error_is_classified() {
        let (executor, quota) = executor(Duration::from_secs(5));
        let registry = registry_with(|| Err(StageError::Validation("bad schema".into())));
        let outcome = executor.execute(&item(), &registry, quota).await;
        match outcome {
            StageOutcome::Failed { class, reason, .. } => {
                assert_eq!(class, FailureClass::Validation);
                assert!(reason.contains("bad schema"));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rate_limit_reset_hint_rides_the_outcome() {
        let (executor, quota) = executor(Duration::from_secs(5));
        let registry = registry_with(|| {
            Err(StageError::RateLimited {
                message: "429 from vision".into(),
                reset_at: Some(
                    chrono::DateTime::parse_from_rfc3339("2026-08-01T12:30:00Z")
                        .unwrap()
                        .with_timezone(&Utc),
                ),
            })
        });
        let outcome = executor.execute(&item(), &registry, quota).await;
        match outcome {
            StageOutcome::Failed {
                class,
                reason,
                retry_at,
                ..
            } => {
                assert_eq!(class, FailureClass::RateLimit);
                assert!(reason.contains("429 from vision"));
                let retry_at = retry_at.expect("reset hint preserved");
                assert_eq!(retry_at.to_rfc3339(), "2026-08-01T12:30:00+00:00");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn quota_signal_becomes_quota_outcome() {
        let (executor, quota) = executor(Duration::from_secs(5));
        let registry = registry_with(|| {
            Err(StageError::QuotaExhausted {
                service: "vision".into(),
                reset_at: Utc::now() + chrono::Duration::minutes(1),
            })
        });
        let outcome = executor.execute(&item(), &registry, quota).await;
        match outcome {
            StageOutcome::QuotaExceeded { service, .. } => assert_eq!(service, "vision"),
            other => panic!("expected QuotaExceeded, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_transient_failure() {
        let (executor, quota) = executor(Duration::from_millis(100));
        let mut registry = HandlerRegistry::new();
        registry.register(Stage::Discovery, Arc::new(SlowHandler));
        let outcome = executor.execute(&item(), &registry, quota).await;
        match outcome {
            StageOutcome::Failed { class, reason, .. } => {
                assert_eq!(class, FailureClass::Transient);
                assert_eq!(reason, "stage timeout");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_handler_is_fatal() {
        let (executor, quota) = executor(Duration::from_secs(5));
        let registry = HandlerRegistry::new();
        let outcome = executor.execute(&item(), &registry, quota).await;
        match outcome {
            StageOutcome::Failed { class, .. } => assert_eq!(class, FailureClass::Fatal),
            other => panic!("expected Failed, got {other:?}"),
        }
    }
}
