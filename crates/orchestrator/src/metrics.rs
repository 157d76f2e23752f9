use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters tracking engine activity.
///
/// All counters use relaxed ordering for maximum throughput. For a
/// consistent point-in-time view, call [`snapshot`](Self::snapshot).
#[derive(Debug, Default)]
pub struct OrchestratorMetrics {
    /// Items claimed by workers.
    pub claims: AtomicU64,
    /// Claims lost to a concurrent worker (compare-and-transition conflict).
    pub claim_conflicts: AtomicU64,
    /// Stage executions started.
    pub stages_executed: AtomicU64,
    /// Stage executions that failed (any class).
    pub stages_failed: AtomicU64,
    /// Items that reached `Completed`.
    pub items_completed: AtomicU64,
    /// Items that reached `DeadLettered`.
    pub items_dead_lettered: AtomicU64,
    /// Items that reached `Cancelled`.
    pub items_cancelled: AtomicU64,
    /// Retries scheduled by the retry policy.
    pub retries_scheduled: AtomicU64,
    /// Items parked in `QuotaExceeded`.
    pub quota_parked: AtomicU64,
    /// Pre-call quota checks that denied.
    pub quota_denied: AtomicU64,
    /// Items returned to `Ready` by the sweeper.
    pub items_resumed: AtomicU64,
    /// Expired-lease `Running` items reclaimed.
    pub lock_reclaims: AtomicU64,
    /// Outbox events delivered to every subscriber.
    pub events_delivered: AtomicU64,
    /// Outbox delivery attempts that failed and were retried.
    pub event_delivery_retries: AtomicU64,
}

/// Point-in-time copy of [`OrchestratorMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub claims: u64,
    pub claim_conflicts: u64,
    pub stages_executed: u64,
    pub stages_failed: u64,
    pub items_completed: u64,
    pub items_dead_lettered: u64,
    pub items_cancelled: u64,
    pub retries_scheduled: u64,
    pub quota_parked: u64,
    pub quota_denied: u64,
    pub items_resumed: u64,
    pub lock_reclaims: u64,
    pub events_delivered: u64,
    pub event_delivery_retries: u64,
}

impl OrchestratorMetrics {
    /// Increment one counter by one.
    pub fn incr(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a point-in-time copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            claims: self.claims.load(Ordering::Relaxed),
            claim_conflicts: self.claim_conflicts.load(Ordering::Relaxed),
            stages_executed: self.stages_executed.load(Ordering::Relaxed),
            stages_failed: self.stages_failed.load(Ordering::Relaxed),
            items_completed: self.items_completed.load(Ordering::Relaxed),
            items_dead_lettered: self.items_dead_lettered.load(Ordering::Relaxed),
            items_cancelled: self.items_cancelled.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            quota_parked: self.quota_parked.load(Ordering::Relaxed),
            quota_denied: self.quota_denied.load(Ordering::Relaxed),
            items_resumed: self.items_resumed.load(Ordering::Relaxed),
            lock_reclaims: self.lock_reclaims.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            event_delivery_retries: self.event_delivery_retries.load(Ordering::Relaxed),
        }
    }
}
