use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use labelsquor_core::{
    FailureClass, LastError, Metric, MetricKind, OrchestratorConfig, RetryDecision, StageOutcome,
    WorkItem, WorkState,
};
use labelsquor_store::{
    ClaimCandidate, FieldUpdate, StoreError, TransitionChanges, TransitionOutcome,
    TransitionRequest, WorkItemStore,
};

use crate::dispatcher::Dispatcher;
use crate::executor::StageExecutor;
use crate::handler::HandlerRegistry;
use crate::lock::{LockLease, LockManager};
use crate::metrics::OrchestratorMetrics;
use crate::quota::QuotaManager;

/// Bounded in-iteration retries against a flapping store before the worker
/// gives up on the iteration and sleeps.
const STORE_RETRY_ATTEMPTS: u32 = 3;

/// One cooperating worker: claims ready items, drives them through a single
/// stage under the item lock, maps the outcome to transitions, and releases
/// the lock. A linear actor; every blocking step yields to the runtime.
pub struct Worker {
    id: String,
    store: Arc<dyn WorkItemStore>,
    dispatcher: Arc<Dispatcher>,
    executor: Arc<StageExecutor>,
    registry: Arc<HandlerRegistry>,
    quota: Arc<QuotaManager>,
    locks: LockManager,
    config: Arc<OrchestratorConfig>,
    metrics: Arc<OrchestratorMetrics>,
    shutdown: CancellationToken,
}

impl Worker {
    /// Create a worker with the given identity.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        store: Arc<dyn WorkItemStore>,
        dispatcher: Arc<Dispatcher>,
        executor: Arc<StageExecutor>,
        registry: Arc<HandlerRegistry>,
        quota: Arc<QuotaManager>,
        config: Arc<OrchestratorConfig>,
        metrics: Arc<OrchestratorMetrics>,
        shutdown: CancellationToken,
    ) -> Self {
        let locks = LockManager::new(
            store.clone(),
            Duration::from_secs(config.lock_lease_seconds),
        );
        Self {
            id: id.into(),
            store,
            dispatcher,
            executor,
            registry,
            quota,
            locks,
            config,
            metrics,
            shutdown,
        }
    }

    /// Run the claim loop until shutdown is requested.
    pub async fn run(self) {
        info!(worker = %self.id, "worker started");
        let mut idle_backoff_ms = self.config.worker_idle_backoff_min_ms;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.iteration().await {
                Ok(true) => {
                    idle_backoff_ms = self.config.worker_idle_backoff_min_ms;
                }
                Ok(false) => {
                    tokio::select! {
                        () = self.shutdown.cancelled() => break,
                        () = tokio::time::sleep(Duration::from_millis(idle_backoff_ms)) => {}
                    }
                    idle_backoff_ms =
                        (idle_backoff_ms * 2).min(self.config.worker_idle_backoff_max_ms);
                }
                Err(e) => {
                    // The store is unreachable; item state is untouched, so
                    // back off and retry the loop from scratch.
                    warn!(worker = %self.id, error = %e, "worker iteration failed");
                    tokio::select! {
                        () = self.shutdown.cancelled() => break,
                        () = tokio::time::sleep(Duration::from_millis(
                            self.config.worker_idle_backoff_max_ms,
                        )) => {}
                    }
                }
            }
        }
        info!(worker = %self.id, "worker stopped");
    }

    /// One pass of the loop. Returns whether any work was attempted.
    pub(crate) async fn iteration(&self) -> Result<bool, StoreError> {
        let Some(claim) = self.dispatcher.claim_next().await? else {
            return Ok(false);
        };
        let item_id = claim.item.id.clone();
        let result = self.process_claim(claim).await;
        self.dispatcher.release(&item_id);
        result.map(|()| true)
    }

    #[instrument(name = "worker.process", skip_all, fields(worker = %self.id, item_id = %claim.item.id))]
    async fn process_claim(&self, claim: ClaimCandidate) -> Result<(), StoreError> {
        let Some(lease) = self.locks.try_acquire(&claim.item.id, &self.id).await? else {
            debug!("lock held elsewhere, skipping");
            return Ok(());
        };

        let result = if claim.reclaim {
            self.reclaim_expired(&claim.item).await
        } else {
            self.run_stage_cycle(&claim.item, &lease).await
        };

        if let Err(e) = lease.release().await {
            warn!(error = %e, "failed to release lock");
        }
        result
    }

    /// Fail an expired-lease `Running` item on behalf of its dead owner,
    /// then run it through the retry policy.
    async fn reclaim_expired(&self, stale: &WorkItem) -> Result<(), StoreError> {
        self.metrics.incr(&self.metrics.lock_reclaims);
        let req = TransitionRequest::new(
            &stale.id,
            stale.version,
            WorkState::Running,
            WorkState::Failed,
            "lock_expired",
            &self.id,
        )
        .with_metadata(serde_json::json!({"previous_holder": stale.lock_holder}))
        .with_changes(TransitionChanges {
            increment_attempt: true,
            last_error: FieldUpdate::Set(LastError {
                class: FailureClass::Transient,
                message: "lock lease expired".into(),
            }),
            ..TransitionChanges::default()
        });

        match self.transition_with_retry(req).await? {
            TransitionOutcome::Applied(item) => {
                self.apply_retry_decision(&item, FailureClass::Transient, "lock_expired", None)
                    .await
            }
            TransitionOutcome::Conflict(_) => {
                debug!("reclaim lost the race");
                Ok(())
            }
        }
    }

    /// Claim the item authoritatively and run its current stage.
    async fn run_stage_cycle(
        &self,
        snapshot: &WorkItem,
        lease: &LockLease,
    ) -> Result<(), StoreError> {
        let req = TransitionRequest::new(
            &snapshot.id,
            snapshot.version,
            WorkState::Ready,
            WorkState::Running,
            "claimed",
            &self.id,
        )
        .with_changes(TransitionChanges {
            next_attempt_at: FieldUpdate::Clear,
            ..TransitionChanges::default()
        });

        let item = match self.transition_with_retry(req).await? {
            TransitionOutcome::Applied(item) => *item,
            TransitionOutcome::Conflict(_) => {
                self.metrics.incr(&self.metrics.claim_conflicts);
                debug!("lost claim race");
                return Ok(());
            }
        };
        self.metrics.incr(&self.metrics.claims);

        // Cancellation is observed at the stage boundary, before any work.
        if item.cancel_requested {
            let req = TransitionRequest::new(
                &item.id,
                item.version,
                WorkState::Running,
                WorkState::Cancelled,
                "cancel_requested",
                &self.id,
            );
            if self.transition_with_retry(req).await?.is_applied() {
                self.metrics.incr(&self.metrics.items_cancelled);
            }
            return Ok(());
        }

        let outcome = self.execute_with_heartbeat(&item, lease).await;
        self.apply_outcome(item, outcome).await
    }

    /// Run the stage while periodically extending the lock lease, so a
    /// healthy long-running stage is never reclaimed out from under us.
    async fn execute_with_heartbeat(&self, item: &WorkItem, lease: &LockLease) -> StageOutcome {
        let period = Duration::from_secs((self.config.lock_lease_seconds / 2).max(1));

        let exec = self
            .executor
            .execute(item, &self.registry, self.quota.clone());
        tokio::pin!(exec);

        let mut heartbeat = tokio::time::interval(period);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                outcome = &mut exec => break outcome,
                _ = heartbeat.tick() => {
                    match lease.extend().await {
                        Ok(true) => {}
                        Ok(false) => warn!(item_id = %item.id, "lease extension refused"),
                        Err(e) => warn!(item_id = %item.id, error = %e, "lease extension failed"),
                    }
                }
            }
        }
    }

    /// Map a normalized stage outcome to its transition(s).
    async fn apply_outcome(
        &self,
        item: WorkItem,
        outcome: StageOutcome,
    ) -> Result<(), StoreError> {
        match outcome {
            StageOutcome::Done { summary }
            | StageOutcome::Partial {
                summary,
                continue_next: true,
            } => self.advance(item, summary).await,

            StageOutcome::Partial {
                summary,
                continue_next: false,
            } => {
                let stage = item.stage;
                let req = TransitionRequest::new(
                    &item.id,
                    item.version,
                    WorkState::Running,
                    WorkState::Waiting,
                    "stage_yielded",
                    &self.id,
                )
                .with_changes(TransitionChanges {
                    record_partial: Some((stage, summary)),
                    ..TransitionChanges::default()
                });
                self.transition_with_retry(req).await?;
                Ok(())
            }

            StageOutcome::QuotaExceeded {
                service,
                reset_at,
                partial,
            } => {
                // Jitter spreads resumed items past the reset boundary so
                // they do not stampede the freshly reset window.
                let jitter_ms: i64 = {
                    let max_ms = self
                        .config
                        .quota_resume_jitter_seconds
                        .saturating_mul(1_000)
                        .cast_signed();
                    rand::thread_rng().gen_range(0..=max_ms.max(1))
                };
                let next_attempt = reset_at + chrono::Duration::milliseconds(jitter_ms);

                let req = TransitionRequest::new(
                    &item.id,
                    item.version,
                    WorkState::Running,
                    WorkState::QuotaExceeded,
                    "quota_exhausted",
                    &self.id,
                )
                .with_metadata(serde_json::json!({
                    "service": service,
                    "reset_at": reset_at,
                    "progress_percentage": item.progress_percentage(),
                    "partial": partial,
                }))
                .with_changes(TransitionChanges {
                    increment_quota_exceeded: true,
                    next_attempt_at: FieldUpdate::Set(next_attempt),
                    last_error: FieldUpdate::Set(LastError {
                        class: FailureClass::RateLimit,
                        message: format!("quota exhausted for {service}"),
                    }),
                    ..TransitionChanges::default()
                });
                self.transition_with_retry(req).await?;
                self.metrics.incr(&self.metrics.quota_parked);
                Ok(())
            }

            StageOutcome::Failed {
                class,
                reason,
                details,
                retry_at,
            } => {
                let req = TransitionRequest::new(
                    &item.id,
                    item.version,
                    WorkState::Running,
                    WorkState::Failed,
                    &reason,
                    &self.id,
                )
                .with_metadata(details)
                .with_changes(TransitionChanges {
                    increment_attempt: class == FailureClass::Transient,
                    last_error: FieldUpdate::Set(LastError {
                        class,
                        message: reason.clone(),
                    }),
                    ..TransitionChanges::default()
                });
                match self.transition_with_retry(req).await? {
                    TransitionOutcome::Applied(failed) => {
                        self.apply_retry_decision(&failed, class, &reason, retry_at)
                            .await
                    }
                    TransitionOutcome::Conflict(_) => Ok(()),
                }
            }
        }
    }

    /// Advance past a successful stage: forward to the next stage, or
    /// complete the pipeline after the final one.
    #[allow(clippy::cast_precision_loss)]
    async fn advance(
        &self,
        item: WorkItem,
        summary: serde_json::Value,
    ) -> Result<(), StoreError> {
        let stage = item.stage;
        let req = match stage.next() {
            Some(next_stage) => TransitionRequest::new(
                &item.id,
                item.version,
                WorkState::Running,
                WorkState::Ready,
                "stage_done",
                &self.id,
            )
            .with_changes(TransitionChanges {
                stage: Some(next_stage),
                record_partial: Some((stage, summary)),
                last_error: FieldUpdate::Clear,
                ..TransitionChanges::default()
            }),
            None => TransitionRequest::new(
                &item.id,
                item.version,
                WorkState::Running,
                WorkState::Completed,
                "pipeline_complete",
                &self.id,
            )
            .with_changes(TransitionChanges {
                record_partial: Some((stage, summary)),
                next_attempt_at: FieldUpdate::Clear,
                last_error: FieldUpdate::Clear,
                ..TransitionChanges::default()
            }),
        };

        if let TransitionOutcome::Applied(updated) = self.transition_with_retry(req).await? {
            if updated.state == WorkState::Completed {
                self.metrics.incr(&self.metrics.items_completed);
                if let Some(completed_at) = updated.completed_at {
                    let total_ms =
                        (completed_at - updated.enqueued_at).num_milliseconds() as f64;
                    if let Err(e) = self
                        .store
                        .record_metric(Metric::new(
                            Some(updated.id.clone()),
                            MetricKind::StateDurationMs,
                            "pipeline",
                            total_ms,
                            Utc::now(),
                        ))
                        .await
                    {
                        warn!(error = %e, "failed to record pipeline duration");
                    }
                }
            }
        }
        Ok(())
    }

    /// Decide and apply the post-failure transition. `rate_limit_reset` is
    /// the externally reported reset instant for `RateLimit` failures.
    async fn apply_retry_decision(
        &self,
        failed: &WorkItem,
        class: FailureClass,
        reason: &str,
        rate_limit_reset: Option<chrono::DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let decision =
            self.config
                .retry
                .decide(class, failed.attempt_count, Utc::now(), rate_limit_reset);

        match decision {
            RetryDecision::RetryAt(at) => {
                let req = TransitionRequest::new(
                    &failed.id,
                    failed.version,
                    WorkState::Failed,
                    WorkState::RetryScheduled,
                    "retry_scheduled",
                    &self.id,
                )
                .with_metadata(serde_json::json!({"attempt": failed.attempt_count}))
                .with_changes(TransitionChanges {
                    next_attempt_at: FieldUpdate::Set(at),
                    ..TransitionChanges::default()
                });
                if self.transition_with_retry(req).await?.is_applied() {
                    self.metrics.incr(&self.metrics.retries_scheduled);
                    if let Err(e) = self
                        .store
                        .record_metric(Metric::new(
                            Some(failed.id.clone()),
                            MetricKind::RetryCount,
                            class.as_str(),
                            f64::from(failed.attempt_count),
                            Utc::now(),
                        ))
                        .await
                    {
                        warn!(error = %e, "failed to record retry metric");
                    }
                }
                Ok(())
            }

            RetryDecision::Suspend => {
                let req = TransitionRequest::new(
                    &failed.id,
                    failed.version,
                    WorkState::Failed,
                    WorkState::Suspended,
                    "suspended_for_inspection",
                    &self.id,
                );
                self.transition_with_retry(req).await?;
                Ok(())
            }

            RetryDecision::DeadLetter => {
                let dead_reason = if class == FailureClass::Fatal {
                    "fatal_failure"
                } else {
                    "retries_exhausted"
                };
                let req = TransitionRequest::new(
                    &failed.id,
                    failed.version,
                    WorkState::Failed,
                    WorkState::DeadLettered,
                    dead_reason,
                    &self.id,
                )
                .with_changes(TransitionChanges {
                    next_attempt_at: FieldUpdate::Clear,
                    ..TransitionChanges::default()
                });
                if self.transition_with_retry(req).await?.is_applied() {
                    self.metrics.incr(&self.metrics.items_dead_lettered);

                    let mut error_chain =
                        vec![format!("{class}: {reason} (attempt {})", failed.attempt_count)];
                    if let Some(last) = &failed.last_error
                        && last.message != *reason
                    {
                        error_chain.push(format!("{}: {}", last.class, last.message));
                    }
                    self.store
                        .insert_dead_letter(labelsquor_core::DeadLetterEntry::new(
                            &failed.id,
                            error_chain,
                            Utc::now(),
                        ))
                        .await?;
                    if let Err(e) = self
                        .store
                        .append_event(labelsquor_core::Event::new(
                            &failed.id,
                            labelsquor_core::EventType::DeadLettered,
                            serde_json::json!({"class": class, "reason": reason}),
                            Utc::now(),
                        ))
                        .await
                    {
                        warn!(error = %e, "failed to append dead-letter event");
                    }
                }
                Ok(())
            }
        }
    }

    /// Apply a transition with bounded retries against a flapping store.
    async fn transition_with_retry(
        &self,
        req: TransitionRequest,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut attempt = 0;
        loop {
            match self.store.transition(req.clone()).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_retryable() && attempt < STORE_RETRY_ATTEMPTS => {
                    attempt += 1;
                    warn!(error = %e, attempt, "store transition retry");
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
