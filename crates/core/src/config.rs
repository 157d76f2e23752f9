use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::quota::{QuotaDimension, QuotaLimit, QuotaWindow};
use crate::retry::RetryPolicy;

/// Per-service quota override: `window -> dimension -> limit`.
pub type QuotaOverrides = HashMap<String, HashMap<String, u64>>;

/// Immutable engine configuration, loaded once at process start.
///
/// Deserializable so hosts can read it from a config file; the engine never
/// mutates it after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Parallel workers per process.
    pub num_workers: usize,
    /// Lock lease duration in seconds.
    pub lock_lease_seconds: u64,
    /// Per-stage hard timeout in seconds.
    pub stage_timeout_seconds: u64,
    /// Backoff shape and transient retry budget.
    pub retry: RetryPolicy,
    /// Resume sweeper period in seconds.
    pub sweeper_interval_seconds: u64,
    /// Bound on graceful shutdown in seconds.
    pub shutdown_grace_seconds: u64,
    /// Idle worker sleep floor in milliseconds.
    pub worker_idle_backoff_min_ms: u64,
    /// Idle worker sleep ceiling in milliseconds.
    pub worker_idle_backoff_max_ms: u64,
    /// Outbox delivery poll period in milliseconds.
    pub event_poll_interval_ms: u64,
    /// Jitter in seconds added to `next_attempt_at` when parking on quota
    /// exhaustion, so resumed items do not stampede the reset boundary.
    pub quota_resume_jitter_seconds: u64,
    /// Per-service quota limit overrides: `service -> window -> limit`,
    /// where the window key is `"{window}_{dimension}"` (e.g.
    /// `per_minute_tokens`). Services not listed use the built-in defaults.
    pub quota_limits: QuotaOverrides,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            lock_lease_seconds: 300,
            stage_timeout_seconds: 300,
            retry: RetryPolicy::default(),
            sweeper_interval_seconds: 15,
            shutdown_grace_seconds: 30,
            worker_idle_backoff_min_ms: 100,
            worker_idle_backoff_max_ms: 5_000,
            event_poll_interval_ms: 500,
            quota_resume_jitter_seconds: 5,
            quota_limits: HashMap::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Validate invariants the engine depends on.
    ///
    /// # Errors
    ///
    /// Returns a human-readable description of the first violated
    /// constraint.
    pub fn validate(&self) -> Result<(), String> {
        if self.num_workers == 0 {
            return Err("num_workers must be at least 1".into());
        }
        if self.lock_lease_seconds == 0 {
            return Err("lock_lease_seconds must be positive".into());
        }
        if self.stage_timeout_seconds == 0 {
            return Err("stage_timeout_seconds must be positive".into());
        }
        if self.worker_idle_backoff_min_ms > self.worker_idle_backoff_max_ms {
            return Err("worker_idle_backoff_min_ms exceeds the maximum".into());
        }
        if !(0.0..1.0).contains(&self.retry.jitter) {
            return Err("retry.jitter must be in [0, 1)".into());
        }
        Ok(())
    }

    /// Effective quota limits for `service`: built-in defaults overlaid
    /// with any configured overrides.
    #[must_use]
    pub fn quota_limits_for(&self, service: &str) -> Vec<QuotaLimit> {
        let mut limits = crate::quota::default_limits(service);
        if let Some(overrides) = self.quota_limits.get(service) {
            for limit in &mut limits {
                let key = format!("{}_{}", limit.window.label(), limit.dimension.label());
                if let Some(value) = overrides.get(&key) {
                    limit.limit = *value;
                }
            }
        }
        limits
    }
}

/// Parse an override key of the form `"{window}_{dimension}"`.
#[must_use]
pub fn parse_limit_key(key: &str) -> Option<(QuotaWindow, QuotaDimension)> {
    for window in QuotaWindow::ALL {
        for dimension in QuotaDimension::ALL {
            if key == format!("{}_{}", window.label(), dimension.label()) {
                return Some((window, dimension));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = OrchestratorConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.num_workers, 4);
        assert_eq!(cfg.lock_lease_seconds, 300);
        assert_eq!(cfg.sweeper_interval_seconds, 15);
    }

    #[test]
    fn zero_workers_rejected() {
        let cfg = OrchestratorConfig {
            num_workers: 0,
            ..OrchestratorConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn inverted_backoff_bounds_rejected() {
        let cfg = OrchestratorConfig {
            worker_idle_backoff_min_ms: 10_000,
            worker_idle_backoff_max_ms: 1_000,
            ..OrchestratorConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn quota_overrides_apply() {
        let mut per_service = HashMap::new();
        per_service.insert("per_minute_requests".to_string(), 5u64);
        let mut overrides = HashMap::new();
        overrides.insert("vision".to_string(), per_service);

        let cfg = OrchestratorConfig {
            quota_limits: overrides,
            ..OrchestratorConfig::default()
        };
        let limits = cfg.quota_limits_for("vision");
        let requests = limits
            .iter()
            .find(|l| l.window == QuotaWindow::PerMinute && l.dimension == QuotaDimension::Requests)
            .unwrap();
        assert_eq!(requests.limit, 5);
        // Untouched cells keep defaults.
        let tokens = limits
            .iter()
            .find(|l| l.window == QuotaWindow::PerMinute && l.dimension == QuotaDimension::Tokens)
            .unwrap();
        assert_eq!(tokens.limit, 4_000_000);
    }

    #[test]
    fn limit_key_parsing() {
        assert_eq!(
            parse_limit_key("per_minute_tokens"),
            Some((QuotaWindow::PerMinute, QuotaDimension::Tokens))
        );
        assert_eq!(
            parse_limit_key("per_day_requests"),
            Some((QuotaWindow::PerDay, QuotaDimension::Requests))
        );
        assert_eq!(parse_limit_key("weekly_tokens"), None);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let cfg: OrchestratorConfig = serde_json::from_str("{\"num_workers\": 8}").unwrap();
        assert_eq!(cfg.num_workers, 8);
        assert_eq!(cfg.lock_lease_seconds, 300);
    }
}
