use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use labelsquor_core::{Event, EventType, OrchestratorConfig, WorkItem, WorkState};
use labelsquor_store::{
    FieldUpdate, StoreError, TransitionChanges, TransitionRequest, WorkItemStore,
};

use crate::metrics::OrchestratorMetrics;
use crate::quota::QuotaManager;

/// Items examined per sweep tick.
const SWEEP_BATCH: usize = 256;

/// Periodically returns parked items to `Ready`: retry-scheduled items whose
/// backoff has elapsed, and quota-parked items whose service has capacity
/// again. Compare-and-transition losers are skipped; another instance got
/// there first.
pub struct ResumeSweeper {
    store: Arc<dyn WorkItemStore>,
    quota: Arc<QuotaManager>,
    config: Arc<OrchestratorConfig>,
    metrics: Arc<OrchestratorMetrics>,
    shutdown: CancellationToken,
}

impl ResumeSweeper {
    /// Create a sweeper over the given store and quota manager.
    #[must_use]
    pub fn new(
        store: Arc<dyn WorkItemStore>,
        quota: Arc<QuotaManager>,
        config: Arc<OrchestratorConfig>,
        metrics: Arc<OrchestratorMetrics>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            quota,
            config,
            metrics,
            shutdown,
        }
    }

    /// Run sweep ticks until shutdown.
    pub async fn run(self) {
        info!(
            interval_seconds = self.config.sweeper_interval_seconds,
            "resume sweeper started"
        );
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.sweeper_interval_seconds));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "sweep tick failed");
                    }
                }
            }
        }
        info!("resume sweeper stopped");
    }

    /// One sweep pass over everything currently due.
    pub(crate) async fn tick(&self) -> Result<(), StoreError> {
        let due = self.store.due_for_resume(Utc::now(), SWEEP_BATCH).await?;
        for item in due {
            match item.state {
                WorkState::RetryScheduled => self.resume(&item, "retry_ready").await?,
                WorkState::QuotaExceeded => self.resume_quota_parked(&item).await?,
                other => {
                    debug!(item_id = %item.id, state = %other, "unexpected state in resume feed");
                }
            }
        }
        Ok(())
    }

    /// Wake a quota-parked item only once its service has capacity again.
    async fn resume_quota_parked(&self, item: &WorkItem) -> Result<(), StoreError> {
        if let Some(service) = self.quota_service_of(item).await? {
            match self.quota.has_capacity(&service).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(item_id = %item.id, service, "quota still exhausted, leaving parked");
                    return Ok(());
                }
                Err(e) => {
                    warn!(item_id = %item.id, error = %e, "quota capacity check failed");
                    return Ok(());
                }
            }
        }
        self.resume(item, "quota_reset").await?;
        if let Err(e) = self
            .store
            .append_event(Event::new(
                &item.id,
                EventType::Resumed,
                serde_json::json!({"stage": item.stage, "reason": "quota_reset"}),
                Utc::now(),
            ))
            .await
        {
            warn!(error = %e, "failed to append resumed event");
        }
        Ok(())
    }

    /// The service that parked this item, read from the transition that put
    /// it into `QuotaExceeded`.
    async fn quota_service_of(&self, item: &WorkItem) -> Result<Option<String>, StoreError> {
        let history = self.store.history(&item.id).await?;
        Ok(history
            .iter()
            .rev()
            .find(|t| t.to_state == WorkState::QuotaExceeded)
            .and_then(|t| t.metadata.get("service"))
            .and_then(serde_json::Value::as_str)
            .map(ToOwned::to_owned))
    }

    async fn resume(&self, item: &WorkItem, reason: &str) -> Result<(), StoreError> {
        let req = TransitionRequest::new(
            &item.id,
            item.version,
            item.state,
            WorkState::Ready,
            reason,
            "sweeper",
        )
        .with_changes(TransitionChanges {
            next_attempt_at: FieldUpdate::Clear,
            ..TransitionChanges::default()
        });

        match self.store.transition(req).await? {
            outcome if outcome.is_applied() => {
                self.metrics.incr(&self.metrics.items_resumed);
                debug!(item_id = %item.id, reason, "item resumed");
            }
            _ => debug!(item_id = %item.id, "resume lost the race"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labelsquor_core::{QuotaCost, QuotaDimension, QuotaLimit, QuotaWindow};
    use labelsquor_store_memory::MemoryWorkItemStore;

    async fn parked_item(
        store: &dyn WorkItemStore,
        id: &str,
        to: WorkState,
        reason: &str,
        metadata: serde_json::Value,
        due_in_past: bool,
    ) {
        let item = WorkItem::new(
            id,
            serde_json::Value::Null,
            0,
            serde_json::Value::Null,
            Utc::now(),
        );
        store.insert(&item).await.unwrap();
        let ready = store
            .transition(TransitionRequest::new(
                id,
                0,
                WorkState::Created,
                WorkState::Ready,
                "enqueued",
                "test",
            ))
            .await
            .unwrap()
            .applied()
            .unwrap();
        let running = store
            .transition(TransitionRequest::new(
                id,
                ready.version,
                WorkState::Ready,
                WorkState::Running,
                "claimed",
                "w1",
            ))
            .await
            .unwrap()
            .applied()
            .unwrap();

        let next_attempt = if due_in_past {
            Utc::now() - chrono::Duration::seconds(1)
        } else {
            Utc::now() + chrono::Duration::hours(1)
        };
        let (from, via) = match to {
            WorkState::RetryScheduled => (WorkState::Failed, true),
            _ => (WorkState::Running, false),
        };
        if via {
            let failed = store
                .transition(TransitionRequest::new(
                    id,
                    running.version,
                    WorkState::Running,
                    WorkState::Failed,
                    "stage_failed",
                    "w1",
                ))
                .await
                .unwrap()
                .applied()
                .unwrap();
            store
                .transition(
                    TransitionRequest::new(id, failed.version, from, to, reason, "w1")
                        .with_metadata(metadata)
                        .with_changes(TransitionChanges {
                            next_attempt_at: FieldUpdate::Set(next_attempt),
                            ..TransitionChanges::default()
                        }),
                )
                .await
                .unwrap();
        } else {
            store
                .transition(
                    TransitionRequest::new(id, running.version, from, to, reason, "w1")
                        .with_metadata(metadata)
                        .with_changes(TransitionChanges {
                            next_attempt_at: FieldUpdate::Set(next_attempt),
                            ..TransitionChanges::default()
                        }),
                )
                .await
                .unwrap();
        }
    }

    fn sweeper_over(store: Arc<dyn WorkItemStore>) -> ResumeSweeper {
        let config = Arc::new(OrchestratorConfig::default());
        ResumeSweeper::new(
            store.clone(),
            Arc::new(QuotaManager::new(store, config.clone())),
            config,
            Arc::new(OrchestratorMetrics::default()),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn due_retry_scheduled_items_become_ready() {
        let store: Arc<dyn WorkItemStore> = Arc::new(MemoryWorkItemStore::new());
        parked_item(
            store.as_ref(),
            "wi-due",
            WorkState::RetryScheduled,
            "retry_scheduled",
            serde_json::Value::Null,
            true,
        )
        .await;
        parked_item(
            store.as_ref(),
            "wi-later",
            WorkState::RetryScheduled,
            "retry_scheduled",
            serde_json::Value::Null,
            false,
        )
        .await;

        sweeper_over(store.clone()).tick().await.unwrap();

        assert_eq!(store.get("wi-due").await.unwrap().state, WorkState::Ready);
        assert!(store.get("wi-due").await.unwrap().next_attempt_at.is_none());
        assert_eq!(
            store.get("wi-later").await.unwrap().state,
            WorkState::RetryScheduled,
            "future retries stay parked"
        );
    }

    #[tokio::test]
    async fn quota_parked_item_resumes_when_capacity_returns() {
        let store: Arc<dyn WorkItemStore> = Arc::new(MemoryWorkItemStore::new());
        parked_item(
            store.as_ref(),
            "wi-quota",
            WorkState::QuotaExceeded,
            "quota_exhausted",
            serde_json::json!({"service": "vision"}),
            true,
        )
        .await;

        sweeper_over(store.clone()).tick().await.unwrap();

        let item = store.get("wi-quota").await.unwrap();
        assert_eq!(item.state, WorkState::Ready, "capacity available, resumed");

        let events = store.undelivered_events(1000).await.unwrap();
        assert!(
            events
                .iter()
                .any(|e| e.work_item_id == "wi-quota"
                    && e.event_type == EventType::Resumed)
        );
    }

    #[tokio::test]
    async fn quota_parked_item_stays_when_window_full() {
        let store: Arc<dyn WorkItemStore> = Arc::new(MemoryWorkItemStore::new());
        // Exhaust the per-minute request window.
        store
            .upsert_quota_limit(QuotaLimit {
                service: "vision".into(),
                window: QuotaWindow::PerMinute,
                dimension: QuotaDimension::Requests,
                limit: 1,
            })
            .await
            .unwrap();
        parked_item(
            store.as_ref(),
            "wi-full",
            WorkState::QuotaExceeded,
            "quota_exhausted",
            serde_json::json!({"service": "vision"}),
            true,
        )
        .await;

        let sweeper = sweeper_over(store.clone());
        sweeper
            .quota
            .record("vision", QuotaCost::default(), "wi-other")
            .await
            .unwrap();

        sweeper.tick().await.unwrap();

        assert_eq!(
            store.get("wi-full").await.unwrap().state,
            WorkState::QuotaExceeded,
            "no capacity, stays parked until the window tumbles"
        );
    }
}
