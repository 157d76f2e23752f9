use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, instrument, warn};

use labelsquor_core::{
    OrchestratorConfig, QuotaCost, QuotaCounter, QuotaDecision, QuotaLimit, QuotaUsageEntry,
};
use labelsquor_store::{StoreError, WorkItemStore};

/// How long resolved limits are cached before re-reading persisted
/// overrides, so changes made by other instances are eventually seen.
const LIMIT_CACHE_TTL_SECS: i64 = 60;

#[derive(Clone)]
struct CachedLimits {
    limits: Vec<QuotaLimit>,
    cached_at: DateTime<Utc>,
}

/// Tracks rolling usage per external service and decides allow/deny.
///
/// `check` + `record` is deliberately not atomic across workers: each worker
/// may over-commit by at most one in-flight request per window. The external
/// service's own rejection re-converges the counters through the
/// quota-exceeded path.
pub struct QuotaManager {
    store: Arc<dyn WorkItemStore>,
    config: Arc<OrchestratorConfig>,
    cache: RwLock<HashMap<String, CachedLimits>>,
}

impl QuotaManager {
    /// Create a manager over the given store and configuration.
    #[must_use]
    pub fn new(store: Arc<dyn WorkItemStore>, config: Arc<OrchestratorConfig>) -> Self {
        Self {
            store,
            config,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Effective limits for `service`: configuration defaults overlaid with
    /// persisted overrides, cached briefly.
    async fn effective_limits(&self, service: &str) -> Result<Vec<QuotaLimit>, StoreError> {
        let now = Utc::now();
        if let Some(cached) = self.cache.read().get(service)
            && (now - cached.cached_at).num_seconds() < LIMIT_CACHE_TTL_SECS
        {
            return Ok(cached.limits.clone());
        }

        let mut limits = self.config.quota_limits_for(service);
        match self.store.quota_limit_overrides(service).await {
            Ok(overrides) => {
                for over in overrides {
                    if let Some(limit) = limits
                        .iter_mut()
                        .find(|l| l.window == over.window && l.dimension == over.dimension)
                    {
                        limit.limit = over.limit;
                    }
                }
            }
            Err(e) => {
                // Stale defaults beat failing the caller's quota check.
                warn!(service, error = %e, "quota override lookup failed, using defaults");
            }
        }

        self.cache.write().insert(
            service.to_owned(),
            CachedLimits {
                limits: limits.clone(),
                cached_at: now,
            },
        );
        Ok(limits)
    }

    fn counter_for<'a>(
        counters: &'a [QuotaCounter],
        limit: &QuotaLimit,
    ) -> Option<&'a QuotaCounter> {
        counters
            .iter()
            .find(|c| c.window == limit.window && c.dimension == limit.dimension)
    }

    /// Evaluate every `(window, dimension)` pair against the estimated cost.
    ///
    /// Denies when any window would be exceeded, returning the earliest
    /// reset instant among the exceeded windows. Callers that wake at that
    /// instant re-check; a longer window still exhausted simply parks them
    /// again.
    #[instrument(name = "quota.check", skip(self, estimate))]
    pub async fn check(
        &self,
        service: &str,
        estimate: QuotaCost,
    ) -> Result<QuotaDecision, StoreError> {
        let now = Utc::now();
        let limits = self.effective_limits(service).await?;
        let counters = self.store.quota_counters(service).await?;

        let mut earliest_reset: Option<DateTime<Utc>> = None;
        for limit in &limits {
            let used = Self::counter_for(&counters, limit)
                .map_or(0, |c| c.effective_used(now));
            if used + estimate.amount(limit.dimension) > limit.limit {
                let reset = limit.window.window_end(now);
                earliest_reset = Some(match earliest_reset {
                    Some(current) => current.min(reset),
                    None => reset,
                });
            }
        }

        match earliest_reset {
            Some(reset_at) => {
                debug!(service, %reset_at, "quota check denied");
                Ok(QuotaDecision::Deny { reset_at })
            }
            None => Ok(QuotaDecision::Allow),
        }
    }

    /// Record the actual cost of a completed external call: increments the
    /// current-window counters and appends the usage log entry.
    #[instrument(name = "quota.record", skip(self, actual))]
    pub async fn record(
        &self,
        service: &str,
        actual: QuotaCost,
        work_item_id: &str,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let limits = self.effective_limits(service).await?;

        for limit in &limits {
            let amount = actual.amount(limit.dimension);
            if amount == 0 {
                continue;
            }
            self.store
                .add_quota_usage(
                    service,
                    limit.window,
                    limit.dimension,
                    limit.window.window_start(now),
                    amount,
                    limit.limit,
                )
                .await?;
        }

        self.store
            .append_usage_log(QuotaUsageEntry::new(service, work_item_id, actual, now))
            .await
    }

    /// Earliest upcoming reset among currently exhausted windows, or `None`
    /// when nothing is exhausted.
    pub async fn reset_instant(
        &self,
        service: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let now = Utc::now();
        let limits = self.effective_limits(service).await?;
        let counters = self.store.quota_counters(service).await?;

        let mut earliest: Option<DateTime<Utc>> = None;
        for limit in &limits {
            let used = Self::counter_for(&counters, limit)
                .map_or(0, |c| c.effective_used(now));
            if used >= limit.limit {
                let reset = limit.window.window_end(now);
                earliest = Some(earliest.map_or(reset, |current| current.min(reset)));
            }
        }
        Ok(earliest)
    }

    /// Whether the service can absorb one more request right now. Used by
    /// the resume sweeper before waking parked items.
    pub async fn has_capacity(&self, service: &str) -> Result<bool, StoreError> {
        Ok(matches!(
            self.check(service, QuotaCost::default()).await?,
            QuotaDecision::Allow
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labelsquor_core::{QuotaDimension, QuotaWindow};
    use labelsquor_store_memory::MemoryWorkItemStore;

    async fn manager_with(
        overrides: Vec<QuotaLimit>,
    ) -> (Arc<dyn WorkItemStore>, QuotaManager) {
        let store: Arc<dyn WorkItemStore> = Arc::new(MemoryWorkItemStore::new());
        for over in overrides {
            store.upsert_quota_limit(over).await.unwrap();
        }
        let manager =
            QuotaManager::new(store.clone(), Arc::new(OrchestratorConfig::default()));
        (store, manager)
    }

    fn cost(tokens: u64) -> QuotaCost {
        QuotaCost {
            input_tokens: tokens,
            output_tokens: 0,
            image_count: 0,
            cost: 0.0,
        }
    }

    #[tokio::test]
    async fn allows_within_limits() {
        let (_, manager) = manager_with(vec![]).await;
        let decision = manager.check("vision", cost(1_000)).await.unwrap();
        assert_eq!(decision, QuotaDecision::Allow);
    }

    #[tokio::test]
    async fn denies_when_request_window_full() {
        let (_, manager) = manager_with(vec![QuotaLimit {
            service: "vision".into(),
            window: QuotaWindow::PerMinute,
            dimension: QuotaDimension::Requests,
            limit: 2,
        }])
        .await;

        manager.record("vision", cost(10), "wi-1").await.unwrap();
        manager.record("vision", cost(10), "wi-2").await.unwrap();

        match manager.check("vision", cost(10)).await.unwrap() {
            QuotaDecision::Deny { reset_at } => {
                let now = Utc::now();
                assert!(reset_at > now);
                assert!(reset_at <= now + chrono::Duration::seconds(61));
            }
            QuotaDecision::Allow => panic!("third request must be denied"),
        }
        assert!(!manager.has_capacity("vision").await.unwrap());
    }

    #[tokio::test]
    async fn deny_reports_earliest_reset() {
        // Both the minute and the day window are exhausted; the minute
        // window resets first and is the reported instant.
        let (_, manager) = manager_with(vec![
            QuotaLimit {
                service: "vision".into(),
                window: QuotaWindow::PerMinute,
                dimension: QuotaDimension::Requests,
                limit: 1,
            },
            QuotaLimit {
                service: "vision".into(),
                window: QuotaWindow::PerDay,
                dimension: QuotaDimension::Requests,
                limit: 1,
            },
        ])
        .await;
        manager.record("vision", cost(1), "wi-1").await.unwrap();

        match manager.check("vision", cost(1)).await.unwrap() {
            QuotaDecision::Deny { reset_at } => {
                // The minute reset wins over the day reset.
                let now = Utc::now();
                assert!(reset_at > now - chrono::Duration::seconds(1));
                assert!(reset_at <= now + chrono::Duration::seconds(61));
            }
            QuotaDecision::Allow => panic!("expected deny"),
        }
        let reset = manager
            .reset_instant("vision")
            .await
            .unwrap()
            .expect("both windows exhausted");
        assert!(reset <= Utc::now() + chrono::Duration::seconds(61));
    }

    #[tokio::test]
    async fn record_appends_usage_log() {
        let (store, manager) = manager_with(vec![]).await;
        manager
            .record(
                "vision",
                QuotaCost {
                    input_tokens: 900,
                    output_tokens: 100,
                    image_count: 2,
                    cost: 0.04,
                },
                "wi-9",
            )
            .await
            .unwrap();

        let logs = store.usage_log("vision", 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].work_item_id, "wi-9");
        assert_eq!(logs[0].input_tokens, 900);
        assert_eq!(logs[0].image_count, 2);
    }

    #[tokio::test]
    async fn token_estimate_checked_against_token_window() {
        let (_, manager) = manager_with(vec![QuotaLimit {
            service: "vision".into(),
            window: QuotaWindow::PerMinute,
            dimension: QuotaDimension::Tokens,
            limit: 1_000,
        }])
        .await;
        manager.record("vision", cost(900), "wi-1").await.unwrap();

        // 200 estimated tokens would exceed the 1000-token minute window.
        assert!(matches!(
            manager.check("vision", cost(200)).await.unwrap(),
            QuotaDecision::Deny { .. }
        ));
        // 50 fits.
        assert_eq!(
            manager.check("vision", cost(50)).await.unwrap(),
            QuotaDecision::Allow
        );
    }
}
