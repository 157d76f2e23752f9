use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tumbling time window over which an external-service usage limit applies.
/// Windows are aligned to UTC minute/day boundaries so every process agrees
/// on where one window ends and the next begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaWindow {
    PerMinute,
    PerDay,
}

impl QuotaWindow {
    /// Both windows, shortest first.
    pub const ALL: [Self; 2] = [Self::PerMinute, Self::PerDay];

    /// Return the window duration in seconds.
    #[must_use]
    pub fn duration_seconds(self) -> i64 {
        match self {
            Self::PerMinute => 60,
            Self::PerDay => 86_400,
        }
    }

    /// Return a short label for display and counter keys.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::PerMinute => "per_minute",
            Self::PerDay => "per_day",
        }
    }

    /// Parse the label back into a window.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|w| w.label() == s)
    }

    /// Start of the window containing `now`. Epoch-aligned division so all
    /// instances agree on boundaries.
    #[must_use]
    pub fn window_start(self, now: DateTime<Utc>) -> DateTime<Utc> {
        let secs = self.duration_seconds();
        let elapsed = now.signed_duration_since(DateTime::UNIX_EPOCH);
        let index = elapsed.num_seconds().div_euclid(secs);
        DateTime::UNIX_EPOCH + chrono::Duration::seconds(index * secs)
    }

    /// Instant the window containing `now` tumbles over.
    #[must_use]
    pub fn window_end(self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.window_start(now) + chrono::Duration::seconds(self.duration_seconds())
    }
}

impl std::fmt::Display for QuotaWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// The measured dimension within a quota window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaDimension {
    Tokens,
    Requests,
}

impl QuotaDimension {
    /// Both dimensions.
    pub const ALL: [Self; 2] = [Self::Tokens, Self::Requests];

    /// Return the label used in counter keys.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Tokens => "tokens",
            Self::Requests => "requests",
        }
    }

    /// Parse the label back into a dimension.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.label() == s)
    }
}

impl std::fmt::Display for QuotaDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A usage limit for one `(service, window, dimension)` cell. Defaults come
/// from configuration; persisted rows override them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimit {
    pub service: String,
    pub window: QuotaWindow,
    pub dimension: QuotaDimension,
    pub limit: u64,
}

/// Current usage of one counter cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaCounter {
    pub service: String,
    pub window: QuotaWindow,
    pub dimension: QuotaDimension,
    pub limit: u64,
    pub used: u64,
    pub window_start: DateTime<Utc>,
}

impl QuotaCounter {
    /// Usage counts as zero once the window has tumbled.
    #[must_use]
    pub fn effective_used(&self, now: DateTime<Utc>) -> u64 {
        let end = self.window_start + chrono::Duration::seconds(self.window.duration_seconds());
        if now >= end { 0 } else { self.used }
    }
}

/// Cost of one external call, estimated before the call and recorded after.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotaCost {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub image_count: u32,
    /// Monetary cost in the service's billing unit.
    pub cost: f64,
}

impl QuotaCost {
    /// Token total counted against token-dimension windows.
    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Usage charged against a given dimension. Every call is one request.
    #[must_use]
    pub fn amount(&self, dimension: QuotaDimension) -> u64 {
        match dimension {
            QuotaDimension::Tokens => self.total_tokens(),
            QuotaDimension::Requests => 1,
        }
    }
}

/// Append-only record of one external call's actual cost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaUsageEntry {
    pub id: String,
    pub service: String,
    pub work_item_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub image_count: u32,
    pub cost: f64,
    pub at: DateTime<Utc>,
}

impl QuotaUsageEntry {
    /// Build a usage-log entry for `cost` stamped `at`.
    #[must_use]
    pub fn new(
        service: impl Into<String>,
        work_item_id: impl Into<String>,
        cost: QuotaCost,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            service: service.into(),
            work_item_id: work_item_id.into(),
            input_tokens: cost.input_tokens,
            output_tokens: cost.output_tokens,
            image_count: cost.image_count,
            cost: cost.cost,
            at,
        }
    }
}

/// Verdict of a pre-call quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    /// Every window has room for the estimated cost.
    Allow,
    /// At least one window would be exceeded; retry after `reset_at` (the
    /// earliest reset among exceeded windows).
    Deny { reset_at: DateTime<Utc> },
}

/// Reference limits for the vision service; overridable via configuration
/// and persisted `QuotaLimit` rows.
#[must_use]
pub fn default_limits(service: &str) -> Vec<QuotaLimit> {
    vec![
        QuotaLimit {
            service: service.to_owned(),
            window: QuotaWindow::PerMinute,
            dimension: QuotaDimension::Tokens,
            limit: 4_000_000,
        },
        QuotaLimit {
            service: service.to_owned(),
            window: QuotaWindow::PerMinute,
            dimension: QuotaDimension::Requests,
            limit: 15,
        },
        QuotaLimit {
            service: service.to_owned(),
            window: QuotaWindow::PerDay,
            dimension: QuotaDimension::Tokens,
            limit: 1_000_000_000,
        },
        QuotaLimit {
            service: service.to_owned(),
            window: QuotaWindow::PerDay,
            dimension: QuotaDimension::Requests,
            limit: 1_500,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn minute_window_aligned() {
        let now = at("2026-02-10T14:30:42Z");
        let start = QuotaWindow::PerMinute.window_start(now);
        assert_eq!(start, at("2026-02-10T14:30:00Z"));
        assert_eq!(
            QuotaWindow::PerMinute.window_end(now),
            at("2026-02-10T14:31:00Z")
        );
    }

    #[test]
    fn day_window_aligned() {
        let now = at("2026-02-10T14:30:42Z");
        assert_eq!(
            QuotaWindow::PerDay.window_start(now),
            at("2026-02-10T00:00:00Z")
        );
        assert_eq!(
            QuotaWindow::PerDay.window_end(now),
            at("2026-02-11T00:00:00Z")
        );
    }

    #[test]
    fn lapsed_counter_reads_zero() {
        let counter = QuotaCounter {
            service: "vision".into(),
            window: QuotaWindow::PerMinute,
            dimension: QuotaDimension::Requests,
            limit: 15,
            used: 15,
            window_start: at("2026-02-10T14:30:00Z"),
        };
        assert_eq!(counter.effective_used(at("2026-02-10T14:30:59Z")), 15);
        assert_eq!(counter.effective_used(at("2026-02-10T14:31:00Z")), 0);
    }

    #[test]
    fn cost_amounts() {
        let cost = QuotaCost {
            input_tokens: 1_000,
            output_tokens: 250,
            image_count: 3,
            cost: 0.02,
        };
        assert_eq!(cost.total_tokens(), 1_250);
        assert_eq!(cost.amount(QuotaDimension::Tokens), 1_250);
        assert_eq!(cost.amount(QuotaDimension::Requests), 1);
    }

    #[test]
    fn reference_limits() {
        let limits = default_limits("vision");
        assert_eq!(limits.len(), 4);
        let per_minute_requests = limits
            .iter()
            .find(|l| l.window == QuotaWindow::PerMinute && l.dimension == QuotaDimension::Requests)
            .unwrap();
        assert_eq!(per_minute_requests.limit, 15);
        let per_day_tokens = limits
            .iter()
            .find(|l| l.window == QuotaWindow::PerDay && l.dimension == QuotaDimension::Tokens)
            .unwrap();
        assert_eq!(per_day_tokens.limit, 1_000_000_000);
    }

    #[test]
    fn labels_roundtrip() {
        for w in QuotaWindow::ALL {
            assert_eq!(QuotaWindow::parse(w.label()), Some(w));
        }
        for d in QuotaDimension::ALL {
            assert_eq!(QuotaDimension::parse(d.label()), Some(d));
        }
    }
}
