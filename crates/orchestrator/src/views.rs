use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use labelsquor_core::{MetricKind, WorkState};
use labelsquor_store::{StoreError, WorkItemStore};

/// Aggregate of a duration series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurationStats {
    pub count: u64,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
}

/// Current utilization of one quota counter cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaUtilization {
    pub service: String,
    pub window: String,
    pub dimension: String,
    pub used: u64,
    pub limit: u64,
    pub utilization_pct: f64,
}

/// Read-only aggregate view of engine activity over a time range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    /// Items per state, now.
    pub state_counts: HashMap<WorkState, u64>,
    /// Items that reached `Completed` within the range.
    pub completed_in_range: u64,
    /// Completions per minute over the range.
    pub throughput_per_minute: f64,
    /// Per-stage handler duration aggregates.
    pub stage_durations: BTreeMap<String, DurationStats>,
    /// Failure occurrences per class.
    pub error_counts: BTreeMap<String, u64>,
    /// Transitions into `QuotaExceeded` within the range.
    pub quota_exceeded_count: u64,
    /// Current quota counter utilization for the requested services.
    pub quota: Vec<QuotaUtilization>,
}

/// Nearest-rank percentile over an unsorted series.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = ((sorted.len() - 1) as f64 * q.clamp(0.0, 1.0)).round() as usize;
    sorted[rank]
}

fn duration_stats(values: &[f64]) -> DurationStats {
    #[allow(clippy::cast_precision_loss)]
    let avg = if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    };
    DurationStats {
        count: values.len() as u64,
        avg_ms: avg,
        p50_ms: percentile(values, 0.5),
        p95_ms: percentile(values, 0.95),
    }
}

/// Compute the aggregate view for `[from, to]`.
///
/// Percentiles are computed here from the raw metric rows so every backend
/// behaves identically; the store trait stays narrow.
#[allow(clippy::cast_precision_loss)]
pub async fn collect_stats(
    store: &Arc<dyn WorkItemStore>,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    services: &[String],
) -> Result<EngineStats, StoreError> {
    let state_counts = store.counts_by_state().await?;

    let transitions = store.transitions_in(from, to).await?;
    let completed_in_range = transitions
        .iter()
        .filter(|t| t.to_state == WorkState::Completed)
        .count() as u64;
    let quota_exceeded_count = transitions
        .iter()
        .filter(|t| t.to_state == WorkState::QuotaExceeded)
        .count() as u64;

    let range_minutes = ((to - from).num_seconds().max(1)) as f64 / 60.0;
    let throughput_per_minute = completed_in_range as f64 / range_minutes;

    let mut stage_series: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for metric in store
        .metrics_in(from, to, Some(MetricKind::StageDurationMs))
        .await?
    {
        stage_series.entry(metric.name).or_default().push(metric.value);
    }
    let stage_durations = stage_series
        .iter()
        .map(|(stage, values)| (stage.clone(), duration_stats(values)))
        .collect();

    let mut error_counts: BTreeMap<String, u64> = BTreeMap::new();
    for metric in store.metrics_in(from, to, Some(MetricKind::Error)).await? {
        *error_counts.entry(metric.name).or_insert(0) += 1;
    }

    let now = Utc::now();
    let mut quota = Vec::new();
    for service in services {
        for counter in store.quota_counters(service).await? {
            let used = counter.effective_used(now);
            let utilization_pct = if counter.limit == 0 {
                0.0
            } else {
                (used as f64 / counter.limit as f64) * 100.0
            };
            quota.push(QuotaUtilization {
                service: counter.service.clone(),
                window: counter.window.label().to_owned(),
                dimension: counter.dimension.label().to_owned(),
                used,
                limit: counter.limit,
                utilization_pct,
            });
        }
    }

    Ok(EngineStats {
        state_counts,
        completed_in_range,
        throughput_per_minute,
        stage_durations,
        error_counts,
        quota_exceeded_count,
        quota,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use labelsquor_core::{Metric, QuotaDimension, QuotaWindow};
    use labelsquor_store_memory::MemoryWorkItemStore;

    #[test]
    fn percentile_nearest_rank() {
        let values: Vec<f64> = (1..=100).map(f64::from).collect();
        assert!((percentile(&values, 0.5) - 50.0).abs() < 1.5);
        assert!((percentile(&values, 0.95) - 95.0).abs() < 1.5);
        assert!((percentile(&values, 0.0) - 1.0).abs() < f64::EPSILON);
        assert!((percentile(&values, 1.0) - 100.0).abs() < f64::EPSILON);
        assert!((percentile(&[], 0.5)).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn stats_aggregate_metrics_and_counters() {
        let store: Arc<dyn WorkItemStore> = Arc::new(MemoryWorkItemStore::new());
        let now = Utc::now();

        for value in [10.0, 20.0, 30.0] {
            store
                .record_metric(Metric::new(
                    Some("wi-1".into()),
                    MetricKind::StageDurationMs,
                    "enrichment",
                    value,
                    now,
                ))
                .await
                .unwrap();
        }
        store
            .record_metric(Metric::new(
                Some("wi-1".into()),
                MetricKind::Error,
                "transient",
                1.0,
                now,
            ))
            .await
            .unwrap();
        store
            .add_quota_usage(
                "vision",
                QuotaWindow::PerMinute,
                QuotaDimension::Requests,
                QuotaWindow::PerMinute.window_start(now),
                3,
                15,
            )
            .await
            .unwrap();

        let stats = collect_stats(
            &store,
            now - chrono::Duration::minutes(5),
            now + chrono::Duration::minutes(5),
            &["vision".to_string()],
        )
        .await
        .unwrap();

        let enrichment = &stats.stage_durations["enrichment"];
        assert_eq!(enrichment.count, 3);
        assert!((enrichment.avg_ms - 20.0).abs() < f64::EPSILON);
        assert_eq!(stats.error_counts["transient"], 1);

        let cell = stats
            .quota
            .iter()
            .find(|q| q.dimension == "requests" && q.window == "per_minute")
            .unwrap();
        assert_eq!(cell.used, 3);
        assert!((cell.utilization_pct - 20.0).abs() < f64::EPSILON);
    }
}
