use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kinds of events written to the durable outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    StateChanged,
    StageStarted,
    StageCompleted,
    StageFailed,
    QuotaExceeded,
    Resumed,
    Locked,
    Unlocked,
    DeadLettered,
}

impl EventType {
    /// Return the snake_case wire form of the event type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StateChanged => "state_changed",
            Self::StageStarted => "stage_started",
            Self::StageCompleted => "stage_completed",
            Self::StageFailed => "stage_failed",
            Self::QuotaExceeded => "quota_exceeded",
            Self::Resumed => "resumed",
            Self::Locked => "locked",
            Self::Unlocked => "unlocked",
            Self::DeadLettered => "dead_lettered",
        }
    }

    /// Parse the snake_case wire form back into an event type.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        [
            Self::StateChanged,
            Self::StageStarted,
            Self::StageCompleted,
            Self::StageFailed,
            Self::QuotaExceeded,
            Self::Resumed,
            Self::Locked,
            Self::Unlocked,
            Self::DeadLettered,
        ]
        .into_iter()
        .find(|t| t.as_str() == s)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable outbox record for downstream subscribers.
///
/// State-changing events are inserted in the same transaction as the state
/// change; the delivery loop reads them back in `seq` order and marks them
/// delivered, giving per-item at-least-once delivery in write order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier (UUID v7).
    pub id: String,
    /// Store-assigned insertion sequence; delivery order.
    pub seq: u64,
    /// The item this event concerns.
    pub work_item_id: String,
    /// Event kind.
    pub event_type: EventType,
    /// Structured event body.
    pub payload: serde_json::Value,
    /// When the event was written.
    pub at: DateTime<Utc>,
    /// Set once every subscriber has handled the event.
    pub delivered: bool,
}

impl Event {
    /// Build an undelivered event stamped `at`. `seq` is assigned by the
    /// store on insert.
    #[must_use]
    pub fn new(
        work_item_id: impl Into<String>,
        event_type: EventType,
        payload: serde_json::Value,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            seq: 0,
            work_item_id: work_item_id.into(),
            event_type,
            payload,
            at,
            delivered: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_wire_roundtrip() {
        for t in [
            EventType::StateChanged,
            EventType::StageStarted,
            EventType::StageCompleted,
            EventType::StageFailed,
            EventType::QuotaExceeded,
            EventType::Resumed,
            EventType::Locked,
            EventType::Unlocked,
            EventType::DeadLettered,
        ] {
            assert_eq!(EventType::parse(t.as_str()), Some(t));
        }
        assert_eq!(EventType::parse("nope"), None);
    }

    #[test]
    fn new_event_is_undelivered() {
        let e = Event::new(
            "wi-1",
            EventType::StageStarted,
            serde_json::json!({"stage": "discovery"}),
            Utc::now(),
        );
        assert!(!e.delivered);
        assert_eq!(e.seq, 0);
    }

    #[test]
    fn serde_roundtrip() {
        let e = Event::new(
            "wi-1",
            EventType::StateChanged,
            serde_json::json!({"from": "ready", "to": "running"}),
            Utc::now(),
        );
        let json = serde_json::to_string(&e).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_type, EventType::StateChanged);
    }
}
