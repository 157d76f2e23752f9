//! Conformance test suite for [`WorkItemStore`] backends.
//!
//! Call [`run_store_conformance_tests`] from a backend's test module with a
//! fresh store instance. Item ids are randomized so the suite can run
//! against shared databases.

use std::time::Duration;

use chrono::Utc;

use labelsquor_core::{
    DeadLetterEntry, Event, EventType, Metric, MetricKind, QuotaDimension, QuotaUsageEntry,
    QuotaWindow, WorkItem, WorkState,
};

use crate::error::StoreError;
use crate::request::{FieldUpdate, TransitionChanges, TransitionRequest};
use crate::store::WorkItemStore;

fn fresh_item(priority: i32) -> WorkItem {
    WorkItem::new(
        format!("conf-{}", uuid::Uuid::new_v4().simple()),
        serde_json::json!({"product_version": "pv-1"}),
        priority,
        serde_json::Value::Null,
        Utc::now(),
    )
}

async fn enqueue(store: &dyn WorkItemStore, priority: i32) -> Result<WorkItem, StoreError> {
    let item = fresh_item(priority);
    store.insert(&item).await?;
    let outcome = store
        .transition(TransitionRequest::new(
            &item.id,
            0,
            WorkState::Created,
            WorkState::Ready,
            "enqueued",
            "conformance",
        ))
        .await?;
    Ok(outcome.applied().expect("fresh item must transition"))
}

/// Run the full store conformance test suite.
///
/// # Errors
///
/// Returns an error if any conformance check fails.
///
/// # Panics
///
/// Panics (via assertions) when a backend violates the store contract.
pub async fn run_store_conformance_tests(store: &dyn WorkItemStore) -> Result<(), StoreError> {
    test_get_missing(store).await?;
    test_insert_and_get(store).await?;
    test_transition_applies_and_audits(store).await?;
    test_transition_version_conflict(store).await?;
    test_transition_wrong_state_conflict(store).await?;
    test_illegal_transition_rejected(store).await?;
    test_lock_mutual_exclusion(store).await?;
    test_lock_lease_expiry(store).await?;
    test_extend_and_release_holder_only(store).await?;
    test_claim_candidates_ordering(store).await?;
    test_claim_candidates_reclaim(store).await?;
    test_due_for_resume(store).await?;
    test_outbox_order_and_delivery(store).await?;
    test_quota_counters(store).await?;
    test_usage_log_and_dead_letters(store).await?;
    test_request_cancel(store).await?;
    Ok(())
}

async fn test_get_missing(store: &dyn WorkItemStore) -> Result<(), StoreError> {
    let err = store.get("conf-missing").await.unwrap_err();
    assert!(
        matches!(err, StoreError::NotFound(_)),
        "get on a missing id should be NotFound"
    );
    Ok(())
}

async fn test_insert_and_get(store: &dyn WorkItemStore) -> Result<(), StoreError> {
    let item = fresh_item(3);
    store.insert(&item).await?;
    let loaded = store.get(&item.id).await?;
    assert_eq!(loaded.state, WorkState::Created);
    assert_eq!(loaded.priority, 3);
    assert_eq!(loaded.version, 0);
    Ok(())
}

async fn test_transition_applies_and_audits(store: &dyn WorkItemStore) -> Result<(), StoreError> {
    let item = enqueue(store, 5).await?;
    assert_eq!(item.state, WorkState::Ready);
    assert_eq!(item.version, 1);

    let history = store.history(&item.id).await?;
    assert_eq!(history.len(), 1, "enqueue must append one audit row");
    assert_eq!(history[0].from_state, WorkState::Created);
    assert_eq!(history[0].to_state, WorkState::Ready);
    assert_eq!(history[0].reason, "enqueued");

    // The co-committed outbox event exists and is undelivered.
    let events = store.undelivered_events(1000).await?;
    let ours: Vec<_> = events
        .iter()
        .filter(|e| e.work_item_id == item.id)
        .collect();
    assert_eq!(ours.len(), 1);
    assert_eq!(ours[0].event_type, EventType::StateChanged);
    Ok(())
}

async fn test_transition_version_conflict(store: &dyn WorkItemStore) -> Result<(), StoreError> {
    let item = enqueue(store, 0).await?;
    let outcome = store
        .transition(TransitionRequest::new(
            &item.id,
            item.version + 7,
            WorkState::Ready,
            WorkState::Running,
            "claimed",
            "conformance",
        ))
        .await?;
    assert!(!outcome.is_applied(), "stale version must conflict");

    let unchanged = store.get(&item.id).await?;
    assert_eq!(unchanged.state, WorkState::Ready);
    assert_eq!(unchanged.version, item.version);
    assert_eq!(
        store.history(&item.id).await?.len(),
        1,
        "conflict must not append an audit row"
    );
    Ok(())
}

async fn test_transition_wrong_state_conflict(
    store: &dyn WorkItemStore,
) -> Result<(), StoreError> {
    let item = enqueue(store, 0).await?;
    // Claims race: the row is Ready but a caller assumes RetryScheduled.
    let outcome = store
        .transition(TransitionRequest::new(
            &item.id,
            item.version,
            WorkState::RetryScheduled,
            WorkState::Ready,
            "retry_ready",
            "sweeper",
        ))
        .await?;
    assert!(!outcome.is_applied(), "wrong from-state must conflict");
    Ok(())
}

async fn test_illegal_transition_rejected(store: &dyn WorkItemStore) -> Result<(), StoreError> {
    let item = enqueue(store, 0).await?;
    let err = store
        .transition(TransitionRequest::new(
            &item.id,
            item.version,
            WorkState::Ready,
            WorkState::Completed,
            "bogus",
            "conformance",
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::IllegalTransition { .. }));
    assert_eq!(
        store.get(&item.id).await?.state,
        WorkState::Ready,
        "illegal request must leave the row untouched"
    );
    Ok(())
}

async fn test_lock_mutual_exclusion(store: &dyn WorkItemStore) -> Result<(), StoreError> {
    let item = enqueue(store, 0).await?;
    let lease = Duration::from_secs(60);

    assert!(store.acquire_lock(&item.id, "w1", lease).await?);
    assert!(
        !store.acquire_lock(&item.id, "w2", lease).await?,
        "second worker must not acquire a held lock"
    );

    let locked = store.get(&item.id).await?;
    assert_eq!(locked.lock_holder.as_deref(), Some("w1"));

    assert!(store.release_lock(&item.id, "w1").await?);
    assert!(store.acquire_lock(&item.id, "w2", lease).await?);
    store.release_lock(&item.id, "w2").await?;
    Ok(())
}

async fn test_lock_lease_expiry(store: &dyn WorkItemStore) -> Result<(), StoreError> {
    let item = enqueue(store, 0).await?;
    assert!(
        store
            .acquire_lock(&item.id, "w1", Duration::from_millis(50))
            .await?
    );
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(
        store
            .acquire_lock(&item.id, "w2", Duration::from_secs(60))
            .await?,
        "an expired lease must be reclaimable"
    );
    store.release_lock(&item.id, "w2").await?;
    Ok(())
}

async fn test_extend_and_release_holder_only(
    store: &dyn WorkItemStore,
) -> Result<(), StoreError> {
    let item = enqueue(store, 0).await?;
    let lease = Duration::from_secs(60);
    assert!(store.acquire_lock(&item.id, "w1", lease).await?);

    assert!(
        !store.extend_lock(&item.id, "w2", lease).await?,
        "only the holder may extend"
    );
    assert!(store.extend_lock(&item.id, "w1", lease).await?);

    assert!(
        !store.release_lock(&item.id, "w2").await?,
        "only the holder may release"
    );
    assert!(store.release_lock(&item.id, "w1").await?);
    Ok(())
}

async fn test_claim_candidates_ordering(store: &dyn WorkItemStore) -> Result<(), StoreError> {
    let low = enqueue(store, 1).await?;
    let high_old = enqueue(store, 9).await?;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let high_new = enqueue(store, 9).await?;

    let now = Utc::now();
    let candidates = store.claim_candidates(now, 1000).await?;
    let ours: Vec<&str> = candidates
        .iter()
        .filter(|c| [&low.id, &high_old.id, &high_new.id].contains(&&c.item.id))
        .map(|c| c.item.id.as_str())
        .collect();
    assert_eq!(
        ours,
        vec![high_old.id.as_str(), high_new.id.as_str(), low.id.as_str()],
        "priority DESC then enqueued_at ASC"
    );

    // A locked item disappears from the feed.
    store
        .acquire_lock(&high_old.id, "w1", Duration::from_secs(60))
        .await?;
    let candidates = store.claim_candidates(now, 1000).await?;
    assert!(candidates.iter().all(|c| c.item.id != high_old.id));
    store.release_lock(&high_old.id, "w1").await?;

    // A future next_attempt_at keeps a Ready item out of the feed.
    let parked = fresh_item(9);
    store.insert(&parked).await?;
    let outcome = store
        .transition(
            TransitionRequest::new(
                &parked.id,
                0,
                WorkState::Created,
                WorkState::Ready,
                "enqueued",
                "conformance",
            )
            .with_changes(TransitionChanges {
                next_attempt_at: FieldUpdate::Set(Utc::now() + chrono::Duration::hours(1)),
                ..TransitionChanges::default()
            }),
        )
        .await?;
    assert!(outcome.is_applied());
    let candidates = store.claim_candidates(Utc::now(), 1000).await?;
    assert!(candidates.iter().all(|c| c.item.id != parked.id));
    Ok(())
}

async fn test_claim_candidates_reclaim(store: &dyn WorkItemStore) -> Result<(), StoreError> {
    let item = enqueue(store, 0).await?;
    assert!(
        store
            .acquire_lock(&item.id, "w1", Duration::from_millis(40))
            .await?
    );
    let running = store
        .transition(TransitionRequest::new(
            &item.id,
            item.version,
            WorkState::Ready,
            WorkState::Running,
            "claimed",
            "w1",
        ))
        .await?
        .applied()
        .expect("claim should apply");
    assert_eq!(running.state, WorkState::Running);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let candidates = store.claim_candidates(Utc::now(), 1000).await?;
    let ours = candidates
        .iter()
        .find(|c| c.item.id == item.id)
        .expect("expired-lease Running item must be a candidate");
    assert!(ours.reclaim, "candidate must be flagged for reclamation");
    Ok(())
}

async fn test_due_for_resume(store: &dyn WorkItemStore) -> Result<(), StoreError> {
    let item = enqueue(store, 0).await?;
    let running = store
        .transition(TransitionRequest::new(
            &item.id,
            item.version,
            WorkState::Ready,
            WorkState::Running,
            "claimed",
            "w1",
        ))
        .await?
        .applied()
        .expect("claim should apply");
    let failed = store
        .transition(TransitionRequest::new(
            &item.id,
            running.version,
            WorkState::Running,
            WorkState::Failed,
            "stage_failed",
            "w1",
        ))
        .await?
        .applied()
        .expect("fail should apply");
    let scheduled = store
        .transition(
            TransitionRequest::new(
                &item.id,
                failed.version,
                WorkState::Failed,
                WorkState::RetryScheduled,
                "retry_scheduled",
                "w1",
            )
            .with_changes(TransitionChanges {
                next_attempt_at: FieldUpdate::Set(Utc::now() - chrono::Duration::seconds(1)),
                ..TransitionChanges::default()
            }),
        )
        .await?
        .applied()
        .expect("schedule should apply");
    assert_eq!(scheduled.state, WorkState::RetryScheduled);

    let due = store.due_for_resume(Utc::now(), 1000).await?;
    assert!(due.iter().any(|i| i.id == item.id), "past due item listed");

    let not_due = store
        .due_for_resume(Utc::now() - chrono::Duration::hours(1), 1000)
        .await?;
    assert!(not_due.iter().all(|i| i.id != item.id));
    Ok(())
}

async fn test_outbox_order_and_delivery(store: &dyn WorkItemStore) -> Result<(), StoreError> {
    let item = enqueue(store, 0).await?;
    store
        .append_event(Event::new(
            &item.id,
            EventType::StageStarted,
            serde_json::json!({"stage": "discovery"}),
            Utc::now(),
        ))
        .await?;
    store
        .append_event(Event::new(
            &item.id,
            EventType::StageCompleted,
            serde_json::json!({"stage": "discovery"}),
            Utc::now(),
        ))
        .await?;

    let events: Vec<Event> = store
        .undelivered_events(1000)
        .await?
        .into_iter()
        .filter(|e| e.work_item_id == item.id)
        .collect();
    assert_eq!(events.len(), 3, "state_changed + two appended");
    assert!(
        events.windows(2).all(|w| w[0].seq < w[1].seq),
        "outbox must be seq-ordered"
    );
    assert_eq!(events[0].event_type, EventType::StateChanged);
    assert_eq!(events[1].event_type, EventType::StageStarted);
    assert_eq!(events[2].event_type, EventType::StageCompleted);

    let ids: Vec<String> = events.iter().map(|e| e.id.clone()).collect();
    store.mark_delivered(&ids).await?;
    let remaining = store.undelivered_events(1000).await?;
    assert!(remaining.iter().all(|e| e.work_item_id != item.id));
    Ok(())
}

async fn test_quota_counters(store: &dyn WorkItemStore) -> Result<(), StoreError> {
    let service = format!("svc-{}", uuid::Uuid::new_v4().simple());
    let now = Utc::now();
    let start = QuotaWindow::PerMinute.window_start(now);

    let used = store
        .add_quota_usage(&service, QuotaWindow::PerMinute, QuotaDimension::Requests, start, 1, 15)
        .await?;
    assert_eq!(used, 1);
    let used = store
        .add_quota_usage(&service, QuotaWindow::PerMinute, QuotaDimension::Requests, start, 4, 15)
        .await?;
    assert_eq!(used, 5, "increments accumulate within a window");

    // A tumbled window starts from zero.
    let next_start = start + chrono::Duration::seconds(60);
    let used = store
        .add_quota_usage(
            &service,
            QuotaWindow::PerMinute,
            QuotaDimension::Requests,
            next_start,
            2,
            15,
        )
        .await?;
    assert_eq!(used, 2);

    let counters = store.quota_counters(&service).await?;
    assert!(
        counters
            .iter()
            .any(|c| c.dimension == QuotaDimension::Requests && c.window_start == next_start),
        "latest window visible in counters"
    );
    Ok(())
}

async fn test_usage_log_and_dead_letters(store: &dyn WorkItemStore) -> Result<(), StoreError> {
    let item = enqueue(store, 0).await?;
    let service = format!("svc-{}", uuid::Uuid::new_v4().simple());
    store
        .append_usage_log(QuotaUsageEntry::new(
            &service,
            &item.id,
            labelsquor_core::QuotaCost {
                input_tokens: 900,
                output_tokens: 100,
                image_count: 2,
                cost: 0.01,
            },
            Utc::now(),
        ))
        .await?;
    let entries = store.usage_log(&service, 10).await?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].work_item_id, item.id);
    assert_eq!(entries[0].input_tokens, 900);

    store
        .insert_dead_letter(DeadLetterEntry::new(
            &item.id,
            vec!["final: connection reset".into()],
            Utc::now(),
        ))
        .await?;
    let letters = store.dead_letters(1000).await?;
    assert!(letters.iter().any(|d| d.work_item_id == item.id));

    store
        .record_metric(Metric::new(
            Some(item.id.clone()),
            MetricKind::StageDurationMs,
            "discovery",
            42.0,
            Utc::now(),
        ))
        .await?;
    let metrics = store
        .metrics_in(
            Utc::now() - chrono::Duration::minutes(5),
            Utc::now() + chrono::Duration::minutes(5),
            Some(MetricKind::StageDurationMs),
        )
        .await?;
    assert!(
        metrics
            .iter()
            .any(|m| m.work_item_id.as_deref() == Some(item.id.as_str()))
    );
    Ok(())
}

async fn test_request_cancel(store: &dyn WorkItemStore) -> Result<(), StoreError> {
    let item = enqueue(store, 0).await?;
    let flagged = store.request_cancel(&item.id).await?;
    assert!(flagged.cancel_requested);
    let reloaded = store.get(&item.id).await?;
    assert!(reloaded.cancel_requested, "flag must persist");
    Ok(())
}
