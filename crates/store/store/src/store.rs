use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use labelsquor_core::{
    DeadLetterEntry, Event, Metric, MetricKind, QuotaCounter, QuotaDimension, QuotaLimit,
    QuotaUsageEntry, QuotaWindow, Transition, WorkItem, WorkState,
};

use crate::error::StoreError;
use crate::request::{TransitionOutcome, TransitionRequest};

/// Filter for listing work items.
#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    /// Restrict to these states; empty means all.
    pub states: Vec<WorkState>,
    /// Restrict to this stage.
    pub stage: Option<labelsquor_core::Stage>,
    /// Minimum priority (inclusive).
    pub min_priority: Option<i32>,
    /// Only items enqueued at or before this instant.
    pub enqueued_before: Option<DateTime<Utc>>,
    /// Maximum rows to return (default 50, clamped to 1..=1000).
    pub limit: Option<u32>,
    /// Rows to skip for pagination.
    pub offset: Option<u32>,
}

impl ItemFilter {
    /// Return the effective limit, clamped to 1..=1000, defaulting to 50.
    #[must_use]
    pub fn effective_limit(&self) -> u32 {
        self.limit.unwrap_or(50).clamp(1, 1000)
    }

    /// Return the effective offset, defaulting to 0.
    #[must_use]
    pub fn effective_offset(&self) -> u32 {
        self.offset.unwrap_or(0)
    }
}

/// A dispatcher candidate: either a claimable `Ready` item or a `Running`
/// item whose lease lapsed and which must be failed-and-reclaimed.
#[derive(Debug, Clone)]
pub struct ClaimCandidate {
    pub item: WorkItem,
    /// Set when the candidate is an expired-lease `Running` item.
    pub reclaim: bool,
}

/// Trait for persisting and mutating orchestrated work items.
///
/// Implementations must be `Send + Sync` and safe for concurrent access.
/// The two primitives everything else depends on are
/// [`transition`](Self::transition) (the sole mutator of `state`, committed
/// atomically with its audit row and outbox event) and
/// [`acquire_lock`](Self::acquire_lock) (conditional on the current lock
/// being absent or expired). Mutual exclusion is enforced here, never by
/// clock comparison in application code.
#[async_trait]
pub trait WorkItemStore: Send + Sync {
    // -- Work items ----------------------------------------------------------

    /// Insert a new work item row. The id must be unused.
    async fn insert(&self, item: &WorkItem) -> Result<(), StoreError>;

    /// Fetch a snapshot by id.
    async fn get(&self, id: &str) -> Result<WorkItem, StoreError>;

    /// List items matching `filter`, newest enqueued first.
    async fn list(&self, filter: &ItemFilter) -> Result<Vec<WorkItem>, StoreError>;

    /// Count items per state (observability).
    async fn counts_by_state(&self) -> Result<HashMap<WorkState, u64>, StoreError>;

    // -- Compare-and-transition ---------------------------------------------

    /// Atomically apply one state change.
    ///
    /// Verifies the requested edge against the legal-transition table
    /// (failing with [`StoreError::IllegalTransition`] before anything is
    /// written), then updates the row conditionally on
    /// `state = from AND version = expected_version`. A zero-row update
    /// yields [`TransitionOutcome::Conflict`] and leaves the store
    /// untouched. On success the row's `version` is bumped, `started_at` /
    /// `completed_at` are maintained, the requested
    /// [`TransitionChanges`](crate::request::TransitionChanges) are
    /// applied, and a [`Transition`] audit row plus a `state_changed`
    /// outbox [`Event`] are inserted in the same transaction. The audit row
    /// records the stage the item was in when the transition was requested
    /// (before any stage advance).
    async fn transition(&self, req: TransitionRequest) -> Result<TransitionOutcome, StoreError>;

    // -- Locks ---------------------------------------------------------------

    /// Take the item's lock for `worker_id` with the given lease iff the
    /// current lock is null or expired. Returns whether the lock was taken.
    async fn acquire_lock(
        &self,
        item_id: &str,
        worker_id: &str,
        lease: Duration,
    ) -> Result<bool, StoreError>;

    /// Push the lease out by `lease` from now, only while `worker_id` still
    /// holds an unexpired lock. Returns whether the lease was extended.
    async fn extend_lock(
        &self,
        item_id: &str,
        worker_id: &str,
        lease: Duration,
    ) -> Result<bool, StoreError>;

    /// Drop the lock, only if `worker_id` is still the holder. Returns
    /// whether a lock was released.
    async fn release_lock(&self, item_id: &str, worker_id: &str) -> Result<bool, StoreError>;

    // -- Scheduling queries --------------------------------------------------

    /// Dispatcher feed: claimable `Ready` items (readiness time passed,
    /// lock free or expired) ordered by `priority DESC, enqueued_at ASC`,
    /// followed by expired-lease `Running` items flagged for reclamation.
    async fn claim_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ClaimCandidate>, StoreError>;

    /// Sweeper feed: `RetryScheduled` and `QuotaExceeded` items whose
    /// `next_attempt_at` has passed.
    async fn due_for_resume(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError>;

    /// Flag a `Running` item for cooperative cancellation; the owning
    /// worker observes the flag at the next stage boundary.
    async fn request_cancel(&self, id: &str) -> Result<WorkItem, StoreError>;

    // -- Events (outbox) -----------------------------------------------------

    /// Append a non-state-changing event (e.g. `stage_started`).
    async fn append_event(&self, event: Event) -> Result<(), StoreError>;

    /// Undelivered events in insertion (`seq`) order.
    async fn undelivered_events(&self, limit: usize) -> Result<Vec<Event>, StoreError>;

    /// Mark events delivered after every subscriber handled them.
    async fn mark_delivered(&self, event_ids: &[String]) -> Result<(), StoreError>;

    // -- Audit trail ---------------------------------------------------------

    /// Ordered transition history of one item, oldest first.
    async fn history(&self, id: &str) -> Result<Vec<Transition>, StoreError>;

    /// Transitions applied within a time range (observability).
    async fn transitions_in(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Transition>, StoreError>;

    // -- Quota ---------------------------------------------------------------

    /// Atomically add `amount` to the `(service, window, dimension)` counter
    /// for the window containing `window_start`, creating (or tumbling) the
    /// row as needed, and return the new `used` value. Row-level locking;
    /// held only for the increment.
    async fn add_quota_usage(
        &self,
        service: &str,
        window: QuotaWindow,
        dimension: QuotaDimension,
        window_start: DateTime<Utc>,
        amount: u64,
        limit: u64,
    ) -> Result<u64, StoreError>;

    /// Current counters for `service` (all windows and dimensions).
    async fn quota_counters(&self, service: &str) -> Result<Vec<QuotaCounter>, StoreError>;

    /// Append one external call's actual cost to the usage log.
    async fn append_usage_log(&self, entry: QuotaUsageEntry) -> Result<(), StoreError>;

    /// Most recent usage-log entries for `service`, newest first.
    async fn usage_log(
        &self,
        service: &str,
        limit: usize,
    ) -> Result<Vec<QuotaUsageEntry>, StoreError>;

    /// Persisted per-service limit overrides, if any.
    async fn quota_limit_overrides(&self, service: &str) -> Result<Vec<QuotaLimit>, StoreError>;

    /// Persist a limit override.
    async fn upsert_quota_limit(&self, limit: QuotaLimit) -> Result<(), StoreError>;

    // -- Metrics -------------------------------------------------------------

    /// Record a numeric observation.
    async fn record_metric(&self, metric: Metric) -> Result<(), StoreError>;

    /// Observations within a time range, optionally filtered by kind.
    async fn metrics_in(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        kind: Option<MetricKind>,
    ) -> Result<Vec<Metric>, StoreError>;

    // -- Dead letters --------------------------------------------------------

    /// Record a permanently failed item.
    async fn insert_dead_letter(&self, entry: DeadLetterEntry) -> Result<(), StoreError>;

    /// Most recent dead letters, newest first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, StoreError>;
}
