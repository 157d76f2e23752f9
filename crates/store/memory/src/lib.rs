//! In-memory [`WorkItemStore`] backend.
//!
//! All tables live behind a single [`parking_lot::Mutex`], which gives the
//! same transactional behavior as the relational backend: a
//! compare-and-transition observes and mutates the row, the audit trail,
//! and the outbox under one critical section. Suitable for tests and
//! single-process development; the lock is never held across an `.await`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use labelsquor_core::{
    DeadLetterEntry, Event, EventType, Metric, MetricKind, QuotaCounter, QuotaDimension,
    QuotaLimit, QuotaUsageEntry, QuotaWindow, Transition, WorkItem, WorkState,
    is_legal_transition,
};
use labelsquor_store::{
    ClaimCandidate, FieldUpdate, ItemFilter, StoreError, TransitionOutcome, TransitionRequest,
    WorkItemStore,
};

#[derive(Default)]
struct Inner {
    items: HashMap<String, WorkItem>,
    transitions: Vec<Transition>,
    events: Vec<Event>,
    next_seq: u64,
    quota_counters: HashMap<(String, QuotaWindow, QuotaDimension), QuotaCounter>,
    quota_limits: HashMap<(String, QuotaWindow, QuotaDimension), QuotaLimit>,
    usage_log: Vec<QuotaUsageEntry>,
    metrics: Vec<Metric>,
    dead_letters: Vec<DeadLetterEntry>,
}

impl Inner {
    fn push_event(&mut self, mut event: Event) {
        self.next_seq += 1;
        event.seq = self.next_seq;
        self.events.push(event);
    }
}

/// In-memory implementation of [`WorkItemStore`].
#[derive(Default)]
pub struct MemoryWorkItemStore {
    inner: Mutex<Inner>,
}

impl MemoryWorkItemStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock_expired(item: &WorkItem, now: DateTime<Utc>) -> bool {
    item.lock_expires_at.is_none_or(|at| at <= now)
}

#[async_trait]
impl WorkItemStore for MemoryWorkItemStore {
    async fn insert(&self, item: &WorkItem) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.items.contains_key(&item.id) {
            return Err(StoreError::Backend(format!(
                "duplicate work item id: {}",
                item.id
            )));
        }
        inner.items.insert(item.id.clone(), item.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<WorkItem, StoreError> {
        self.inner
            .lock()
            .items
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_owned()))
    }

    async fn list(&self, filter: &ItemFilter) -> Result<Vec<WorkItem>, StoreError> {
        let inner = self.inner.lock();
        let mut items: Vec<WorkItem> = inner
            .items
            .values()
            .filter(|item| filter.states.is_empty() || filter.states.contains(&item.state))
            .filter(|item| filter.stage.is_none_or(|s| item.stage == s))
            .filter(|item| filter.min_priority.is_none_or(|p| item.priority >= p))
            .filter(|item| filter.enqueued_before.is_none_or(|at| item.enqueued_at <= at))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.enqueued_at.cmp(&a.enqueued_at).then(a.id.cmp(&b.id)));
        Ok(items
            .into_iter()
            .skip(filter.effective_offset() as usize)
            .take(filter.effective_limit() as usize)
            .collect())
    }

    async fn counts_by_state(&self) -> Result<HashMap<WorkState, u64>, StoreError> {
        let inner = self.inner.lock();
        let mut counts = HashMap::new();
        for item in inner.items.values() {
            *counts.entry(item.state).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn transition(&self, req: TransitionRequest) -> Result<TransitionOutcome, StoreError> {
        if !is_legal_transition(req.from, req.to) {
            return Err(StoreError::IllegalTransition {
                from: req.from,
                to: req.to,
            });
        }

        let mut inner = self.inner.lock();
        let Some(current) = inner.items.get(&req.item_id) else {
            return Err(StoreError::NotFound(req.item_id));
        };
        if current.state != req.from || current.version != req.expected_version {
            return Ok(TransitionOutcome::Conflict(Box::new(current.clone())));
        }

        let now = Utc::now();
        let mut item = current.clone();
        let stage_before = item.stage;

        item.state = req.to;
        item.version += 1;
        if req.to == WorkState::Running && item.started_at.is_none() {
            item.started_at = Some(now);
        }
        if req.to.is_terminal() {
            item.completed_at = Some(now);
        }
        if let Some(stage) = req.changes.stage {
            item.stage = stage;
        }
        if let Some((stage, summary)) = req.changes.record_partial.clone() {
            item.partial_results.insert(stage, summary);
        }
        if req.changes.increment_attempt {
            item.attempt_count += 1;
        }
        if req.changes.increment_quota_exceeded {
            item.quota_exceeded_count += 1;
        }
        match req.changes.next_attempt_at {
            FieldUpdate::Keep => {}
            FieldUpdate::Set(at) => item.next_attempt_at = Some(at),
            FieldUpdate::Clear => item.next_attempt_at = None,
        }
        match req.changes.last_error.clone() {
            FieldUpdate::Keep => {}
            FieldUpdate::Set(err) => item.last_error = Some(err),
            FieldUpdate::Clear => item.last_error = None,
        }
        if req.changes.clear_lock {
            item.lock_holder = None;
            item.lock_acquired_at = None;
            item.lock_expires_at = None;
        }

        inner.items.insert(item.id.clone(), item.clone());
        inner.transitions.push(Transition::new(
            &item.id,
            req.from,
            req.to,
            stage_before,
            &req.reason,
            req.metadata.clone(),
            &req.actor,
            now,
        ));
        inner.push_event(Event::new(
            &item.id,
            EventType::StateChanged,
            serde_json::json!({
                "from": req.from,
                "to": req.to,
                "stage": stage_before,
                "reason": req.reason,
                "actor": req.actor,
                "metadata": req.metadata,
            }),
            now,
        ));

        Ok(TransitionOutcome::Applied(Box::new(item)))
    }

    async fn acquire_lock(
        &self,
        item_id: &str,
        worker_id: &str,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        let Some(item) = inner.items.get_mut(item_id) else {
            return Err(StoreError::NotFound(item_id.to_owned()));
        };
        let now = Utc::now();
        if item.lock_holder.is_some() && !lock_expired(item, now) {
            return Ok(false);
        }
        item.lock_holder = Some(worker_id.to_owned());
        item.lock_acquired_at = Some(now);
        item.lock_expires_at = Some(
            now + chrono::Duration::from_std(lease)
                .map_err(|e| StoreError::Backend(e.to_string()))?,
        );
        Ok(true)
    }

    async fn extend_lock(
        &self,
        item_id: &str,
        worker_id: &str,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        let Some(item) = inner.items.get_mut(item_id) else {
            return Err(StoreError::NotFound(item_id.to_owned()));
        };
        let now = Utc::now();
        if item.lock_holder.as_deref() != Some(worker_id) || lock_expired(item, now) {
            return Ok(false);
        }
        item.lock_expires_at = Some(
            now + chrono::Duration::from_std(lease)
                .map_err(|e| StoreError::Backend(e.to_string()))?,
        );
        Ok(true)
    }

    async fn release_lock(&self, item_id: &str, worker_id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        let Some(item) = inner.items.get_mut(item_id) else {
            return Err(StoreError::NotFound(item_id.to_owned()));
        };
        if item.lock_holder.as_deref() != Some(worker_id) {
            return Ok(false);
        }
        item.lock_holder = None;
        item.lock_acquired_at = None;
        item.lock_expires_at = None;
        Ok(true)
    }

    async fn claim_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ClaimCandidate>, StoreError> {
        let inner = self.inner.lock();

        let mut ready: Vec<&WorkItem> = inner
            .items
            .values()
            .filter(|item| item.is_claimable(now))
            .collect();
        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.enqueued_at.cmp(&b.enqueued_at))
                .then(a.id.cmp(&b.id))
        });

        let mut expired: Vec<&WorkItem> = inner
            .items
            .values()
            .filter(|item| item.is_reclaimable(now))
            .collect();
        expired.sort_by(|a, b| a.lock_expires_at.cmp(&b.lock_expires_at));

        Ok(ready
            .into_iter()
            .map(|item| ClaimCandidate {
                item: item.clone(),
                reclaim: false,
            })
            .chain(expired.into_iter().map(|item| ClaimCandidate {
                item: item.clone(),
                reclaim: true,
            }))
            .take(limit)
            .collect())
    }

    async fn due_for_resume(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let inner = self.inner.lock();
        let mut due: Vec<WorkItem> = inner
            .items
            .values()
            .filter(|item| {
                matches!(
                    item.state,
                    WorkState::RetryScheduled | WorkState::QuotaExceeded
                ) && item.next_attempt_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect();
        due.sort_by(|a, b| a.next_attempt_at.cmp(&b.next_attempt_at));
        due.truncate(limit);
        Ok(due)
    }

    async fn request_cancel(&self, id: &str) -> Result<WorkItem, StoreError> {
        let mut inner = self.inner.lock();
        let Some(item) = inner.items.get_mut(id) else {
            return Err(StoreError::NotFound(id.to_owned()));
        };
        item.cancel_requested = true;
        Ok(item.clone())
    }

    async fn append_event(&self, event: Event) -> Result<(), StoreError> {
        self.inner.lock().push_event(event);
        Ok(())
    }

    async fn undelivered_events(&self, limit: usize) -> Result<Vec<Event>, StoreError> {
        let inner = self.inner.lock();
        let mut events: Vec<Event> = inner
            .events
            .iter()
            .filter(|e| !e.delivered)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.seq);
        events.truncate(limit);
        Ok(events)
    }

    async fn mark_delivered(&self, event_ids: &[String]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        for event in &mut inner.events {
            if event_ids.contains(&event.id) {
                event.delivered = true;
            }
        }
        Ok(())
    }

    async fn history(&self, id: &str) -> Result<Vec<Transition>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .transitions
            .iter()
            .filter(|t| t.work_item_id == id)
            .cloned()
            .collect())
    }

    async fn transitions_in(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Transition>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .transitions
            .iter()
            .filter(|t| t.at >= from && t.at <= to)
            .cloned()
            .collect())
    }

    async fn add_quota_usage(
        &self,
        service: &str,
        window: QuotaWindow,
        dimension: QuotaDimension,
        window_start: DateTime<Utc>,
        amount: u64,
        limit: u64,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        let key = (service.to_owned(), window, dimension);
        let counter = inner.quota_counters.entry(key).or_insert(QuotaCounter {
            service: service.to_owned(),
            window,
            dimension,
            limit,
            used: 0,
            window_start,
        });
        if counter.window_start != window_start {
            // Window tumbled; the old count no longer applies.
            counter.window_start = window_start;
            counter.used = 0;
        }
        counter.used += amount;
        counter.limit = limit;
        Ok(counter.used)
    }

    async fn quota_counters(&self, service: &str) -> Result<Vec<QuotaCounter>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .quota_counters
            .values()
            .filter(|c| c.service == service)
            .cloned()
            .collect())
    }

    async fn append_usage_log(&self, entry: QuotaUsageEntry) -> Result<(), StoreError> {
        self.inner.lock().usage_log.push(entry);
        Ok(())
    }

    async fn usage_log(
        &self,
        service: &str,
        limit: usize,
    ) -> Result<Vec<QuotaUsageEntry>, StoreError> {
        let inner = self.inner.lock();
        let mut entries: Vec<QuotaUsageEntry> = inner
            .usage_log
            .iter()
            .filter(|e| e.service == service)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.at.cmp(&a.at));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn quota_limit_overrides(&self, service: &str) -> Result<Vec<QuotaLimit>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .quota_limits
            .values()
            .filter(|l| l.service == service)
            .cloned()
            .collect())
    }

    async fn upsert_quota_limit(&self, limit: QuotaLimit) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.quota_limits.insert(
            (limit.service.clone(), limit.window, limit.dimension),
            limit,
        );
        Ok(())
    }

    async fn record_metric(&self, metric: Metric) -> Result<(), StoreError> {
        self.inner.lock().metrics.push(metric);
        Ok(())
    }

    async fn metrics_in(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        kind: Option<MetricKind>,
    ) -> Result<Vec<Metric>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .metrics
            .iter()
            .filter(|m| m.at >= from && m.at <= to)
            .filter(|m| kind.is_none_or(|k| m.kind == k))
            .cloned()
            .collect())
    }

    async fn insert_dead_letter(&self, entry: DeadLetterEntry) -> Result<(), StoreError> {
        self.inner.lock().dead_letters.push(entry);
        Ok(())
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let inner = self.inner.lock();
        let mut letters: Vec<DeadLetterEntry> = inner.dead_letters.clone();
        letters.sort_by(|a, b| b.at.cmp(&a.at));
        letters.truncate(limit);
        Ok(letters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labelsquor_store::TransitionChanges;

    #[tokio::test]
    async fn store_conformance() {
        let store = MemoryWorkItemStore::new();
        labelsquor_store::testing::run_store_conformance_tests(&store)
            .await
            .expect("conformance tests should pass");
    }

    #[tokio::test]
    async fn duplicate_insert_rejected() {
        let store = MemoryWorkItemStore::new();
        let item = WorkItem::new("wi-dup", serde_json::Value::Null, 0, serde_json::Value::Null, Utc::now());
        store.insert(&item).await.unwrap();
        let err = store.insert(&item).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
    }

    #[tokio::test]
    async fn transition_maintains_timestamps() {
        let store = MemoryWorkItemStore::new();
        let item = WorkItem::new("wi-ts", serde_json::Value::Null, 0, serde_json::Value::Null, Utc::now());
        store.insert(&item).await.unwrap();

        let ready = store
            .transition(TransitionRequest::new(
                "wi-ts",
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
        assert!(ready.started_at.is_none());

        let running = store
            .transition(TransitionRequest::new(
                "wi-ts",
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
        assert!(running.started_at.is_some());

        let cancelled = store
            .transition(TransitionRequest::new(
                "wi-ts",
                running.version,
                WorkState::Running,
                WorkState::Cancelled,
                "cancel_observed",
                "w1",
            ))
            .await
            .unwrap()
            .applied()
            .unwrap();
        assert!(cancelled.completed_at.is_some());
    }

    #[tokio::test]
    async fn partial_results_merge_across_transitions() {
        let store = MemoryWorkItemStore::new();
        let item = WorkItem::new("wi-pr", serde_json::Value::Null, 0, serde_json::Value::Null, Utc::now());
        store.insert(&item).await.unwrap();
        let ready = store
            .transition(TransitionRequest::new(
                "wi-pr",
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
                "wi-pr",
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

        let advanced = store
            .transition(
                TransitionRequest::new(
                    "wi-pr",
                    running.version,
                    WorkState::Running,
                    WorkState::Ready,
                    "stage_done",
                    "w1",
                )
                .with_changes(TransitionChanges {
                    stage: Some(labelsquor_core::Stage::ImageFetch),
                    record_partial: Some((
                        labelsquor_core::Stage::Discovery,
                        serde_json::json!({"pages": 1}),
                    )),
                    ..TransitionChanges::default()
                }),
            )
            .await
            .unwrap()
            .applied()
            .unwrap();

        assert_eq!(advanced.stage, labelsquor_core::Stage::ImageFetch);
        assert_eq!(
            advanced.partial_results[&labelsquor_core::Stage::Discovery]["pages"],
            1
        );
        // The audit row records the stage that ran, not the advanced one.
        let history = store.history("wi-pr").await.unwrap();
        assert_eq!(
            history.last().unwrap().stage,
            labelsquor_core::Stage::Discovery
        );
    }
}
