use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::outcome::FailureClass;
use crate::stage::{Stage, progress_percentage};
use crate::state::WorkState;

/// The last error observed on a work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    /// Failure class assigned by the stage executor.
    pub class: FailureClass,
    /// Human-readable message.
    pub message: String,
}

/// The unit orchestrated through the pipeline.
///
/// The row is the only mutable shared state in the system; every mutation of
/// `state` goes through the durable store's compare-and-transition primitive,
/// guarded by `version`. Rows are never deleted by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Opaque, unique, stable identifier.
    pub id: String,
    /// Higher first.
    pub priority: i32,
    /// Position in the orchestrator state machine.
    pub state: WorkState,
    /// Current pipeline stage (orthogonal to `state`).
    pub stage: Stage,
    /// Completed failed attempts of the current stage lifecycle.
    pub attempt_count: u32,
    /// Times this item was parked by quota exhaustion.
    pub quota_exceeded_count: u32,
    /// When the item entered the queue.
    pub enqueued_at: DateTime<Utc>,
    /// First `Ready -> Running` instant.
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal-completion instant.
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest instant the item becomes runnable again.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Worker identity currently holding the lease, if any.
    pub lock_holder: Option<String>,
    /// When the current lease was taken.
    pub lock_acquired_at: Option<DateTime<Utc>>,
    /// When the current lease lapses and the item becomes reclaimable.
    pub lock_expires_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency token; bumped on every applied transition.
    pub version: u64,
    /// Opaque reference handed to stage handlers (e.g. a product version id).
    pub payload: serde_json::Value,
    /// Completed-stage -> stage output summary. Preserved across quota
    /// interruptions so a resumed run skips finished stages.
    pub partial_results: BTreeMap<Stage, serde_json::Value>,
    /// Most recent failure, if any.
    pub last_error: Option<LastError>,
    /// Set by `cancel` on a `Running` item; observed at the next stage
    /// boundary.
    pub cancel_requested: bool,
    /// Caller-supplied metadata, carried through untouched.
    pub metadata: serde_json::Value,
}

impl WorkItem {
    /// Build a fresh item in `Created` at the first stage.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        payload: serde_json::Value,
        priority: i32,
        metadata: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            priority,
            state: WorkState::Created,
            stage: Stage::Discovery,
            attempt_count: 0,
            quota_exceeded_count: 0,
            enqueued_at: now,
            started_at: None,
            completed_at: None,
            next_attempt_at: None,
            lock_holder: None,
            lock_acquired_at: None,
            lock_expires_at: None,
            version: 0,
            payload,
            partial_results: BTreeMap::new(),
            last_error: None,
            cancel_requested: false,
            metadata,
        }
    }

    /// Whether the current lease (if any) has lapsed as of `now`.
    #[must_use]
    pub fn is_lock_expired(&self, now: DateTime<Utc>) -> bool {
        match self.lock_expires_at {
            Some(expires) => expires <= now,
            None => true,
        }
    }

    /// A `Running` item whose lease lapsed is reclaimable by any worker.
    #[must_use]
    pub fn is_reclaimable(&self, now: DateTime<Utc>) -> bool {
        self.state == WorkState::Running && self.is_lock_expired(now)
    }

    /// Runnable from `Ready` as of `now` (readiness time passed, lock free
    /// or lapsed).
    #[must_use]
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.state == WorkState::Ready
            && self.next_attempt_at.is_none_or(|at| at <= now)
            && (self.lock_holder.is_none() || self.is_lock_expired(now))
    }

    /// Fraction of the pipeline whose output summaries are recorded.
    #[must_use]
    pub fn progress_percentage(&self) -> f64 {
        progress_percentage(self.partial_results.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn item() -> WorkItem {
        WorkItem::new(
            "wi-1",
            serde_json::json!({"product_version": "pv-42"}),
            5,
            serde_json::Value::Null,
            Utc::now(),
        )
    }

    #[test]
    fn new_item_defaults() {
        let it = item();
        assert_eq!(it.state, WorkState::Created);
        assert_eq!(it.stage, Stage::Discovery);
        assert_eq!(it.version, 0);
        assert_eq!(it.attempt_count, 0);
        assert!(it.partial_results.is_empty());
        assert!(!it.cancel_requested);
    }

    #[test]
    fn lock_expiry() {
        let now = Utc::now();
        let mut it = item();
        assert!(it.is_lock_expired(now), "no lease counts as expired");

        it.lock_holder = Some("w1".into());
        it.lock_expires_at = Some(now + Duration::seconds(300));
        assert!(!it.is_lock_expired(now));
        assert!(it.is_lock_expired(now + Duration::seconds(301)));
    }

    #[test]
    fn reclaimable_only_when_running() {
        let now = Utc::now();
        let mut it = item();
        it.state = WorkState::Running;
        it.lock_holder = Some("w1".into());
        it.lock_expires_at = Some(now - Duration::seconds(1));
        assert!(it.is_reclaimable(now));

        it.state = WorkState::Ready;
        assert!(!it.is_reclaimable(now));
    }

    #[test]
    fn claimable_respects_readiness_time() {
        let now = Utc::now();
        let mut it = item();
        it.state = WorkState::Ready;
        assert!(it.is_claimable(now));

        it.next_attempt_at = Some(now + Duration::seconds(30));
        assert!(!it.is_claimable(now));
        assert!(it.is_claimable(now + Duration::seconds(31)));
    }

    #[test]
    fn progress_follows_partial_results() {
        let mut it = item();
        assert!((it.progress_percentage() - 0.0).abs() < f64::EPSILON);
        it.partial_results
            .insert(Stage::Discovery, serde_json::json!({"pages": 1}));
        it.partial_results
            .insert(Stage::ImageFetch, serde_json::json!({"images": 3}));
        let p = it.progress_percentage();
        assert!(p > 28.0 && p < 29.0);
    }

    #[test]
    fn serde_roundtrip() {
        let it = item();
        let json = serde_json::to_string(&it).unwrap();
        let back: WorkItem = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "wi-1");
        assert_eq!(back.state, WorkState::Created);
        assert_eq!(back.stage, Stage::Discovery);
    }
}
