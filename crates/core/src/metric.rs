use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kinds of numeric observations recorded by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Milliseconds an item spent in a state before leaving it.
    StateDurationMs,
    /// Milliseconds a stage handler ran.
    StageDurationMs,
    /// Retry attempts observed for an item.
    RetryCount,
    /// An error occurrence; `name` carries the failure class.
    Error,
}

impl MetricKind {
    /// Return the snake_case wire form of the metric kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StateDurationMs => "state_duration_ms",
            Self::StageDurationMs => "stage_duration_ms",
            Self::RetryCount => "retry_count",
            Self::Error => "error",
        }
    }

    /// Parse the snake_case wire form back into a metric kind.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        [
            Self::StateDurationMs,
            Self::StageDurationMs,
            Self::RetryCount,
            Self::Error,
        ]
        .into_iter()
        .find(|k| k.as_str() == s)
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single numeric observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    /// Unique identifier (UUID v7).
    pub id: String,
    /// The item this observation concerns, when item-scoped.
    pub work_item_id: Option<String>,
    /// Observation kind.
    pub kind: MetricKind,
    /// Dimension within the kind (a stage name, state name, or error class).
    pub name: String,
    /// Observed value.
    pub value: f64,
    /// When the observation was taken.
    pub at: DateTime<Utc>,
}

impl Metric {
    /// Build a metric observation stamped `at`.
    #[must_use]
    pub fn new(
        work_item_id: Option<String>,
        kind: MetricKind,
        name: impl Into<String>,
        value: f64,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            work_item_id,
            kind,
            name: name.into(),
            value,
            at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_wire_roundtrip() {
        for k in [
            MetricKind::StateDurationMs,
            MetricKind::StageDurationMs,
            MetricKind::RetryCount,
            MetricKind::Error,
        ] {
            assert_eq!(MetricKind::parse(k.as_str()), Some(k));
        }
        assert_eq!(MetricKind::parse("nope"), None);
    }

    #[test]
    fn serde_roundtrip() {
        let m = Metric::new(
            Some("wi-1".into()),
            MetricKind::StageDurationMs,
            "enrichment",
            152.0,
            Utc::now(),
        );
        let json = serde_json::to_string(&m).unwrap();
        let back: Metric = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, MetricKind::StageDurationMs);
        assert_eq!(back.name, "enrichment");
        assert!((back.value - 152.0).abs() < f64::EPSILON);
    }
}
