use chrono::{DateTime, Utc};

use labelsquor_core::{LastError, Stage, WorkItem, WorkState};

/// How a transition updates one optional field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldUpdate<T> {
    /// Leave the stored value untouched.
    Keep,
    /// Replace the stored value.
    Set(T),
    /// Null the stored value.
    Clear,
}

// Manual impl: `Keep` needs no `T: Default` bound.
impl<T> Default for FieldUpdate<T> {
    fn default() -> Self {
        Self::Keep
    }
}

/// Row updates applied together with a state change, inside the same
/// conditional statement.
#[derive(Debug, Clone, Default)]
pub struct TransitionChanges {
    /// Advance (or reset) the pipeline stage.
    pub stage: Option<Stage>,
    /// Merge a completed stage's output summary into `partial_results`.
    pub record_partial: Option<(Stage, serde_json::Value)>,
    /// Count a consumed retry attempt.
    pub increment_attempt: bool,
    /// Count a quota interruption.
    pub increment_quota_exceeded: bool,
    /// Readiness-time update.
    pub next_attempt_at: FieldUpdate<DateTime<Utc>>,
    /// Failure detail update.
    pub last_error: FieldUpdate<LastError>,
    /// Drop the lock as part of the transition (used when a reclaiming
    /// worker fails an expired `Running` item it does not hold the original
    /// lease for).
    pub clear_lock: bool,
}

/// One compare-and-transition request: the sole way `state` changes.
///
/// The store applies it atomically: the conditional row update (guarded by
/// `state = from AND version = expected_version`), the appended
/// [`Transition`](labelsquor_core::Transition) audit row, and the
/// `state_changed` outbox event all commit together, or nothing does.
#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub item_id: String,
    pub expected_version: u64,
    pub from: WorkState,
    pub to: WorkState,
    /// Why the transition happened; recorded verbatim on the audit row.
    pub reason: String,
    /// Structured context for the audit row and event payload.
    pub metadata: serde_json::Value,
    /// Worker identity, `sweeper`, or API caller name.
    pub actor: String,
    pub changes: TransitionChanges,
}

impl TransitionRequest {
    /// Build a request with no field changes beyond the state edge.
    #[must_use]
    pub fn new(
        item_id: impl Into<String>,
        expected_version: u64,
        from: WorkState,
        to: WorkState,
        reason: impl Into<String>,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            expected_version,
            from,
            to,
            reason: reason.into(),
            metadata: serde_json::Value::Null,
            actor: actor.into(),
            changes: TransitionChanges::default(),
        }
    }

    /// Attach structured metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Attach row changes.
    #[must_use]
    pub fn with_changes(mut self, changes: TransitionChanges) -> Self {
        self.changes = changes;
        self
    }
}

/// Result of a compare-and-transition attempt.
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    /// The row was updated; carries the post-transition snapshot.
    Applied(Box<WorkItem>),
    /// `state` or `version` did not match; nothing was written. Carries the
    /// current snapshot so callers can decide whether to re-drive.
    Conflict(Box<WorkItem>),
}

impl TransitionOutcome {
    /// The applied snapshot, or `None` on conflict.
    #[must_use]
    pub fn applied(self) -> Option<WorkItem> {
        match self {
            Self::Applied(item) => Some(*item),
            Self::Conflict(_) => None,
        }
    }

    /// Whether the transition was applied.
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_keep_fields() {
        let changes = TransitionChanges::default();
        assert_eq!(changes.next_attempt_at, FieldUpdate::Keep);
        assert_eq!(changes.last_error, FieldUpdate::Keep);
        assert!(changes.stage.is_none());
        assert!(!changes.clear_lock);
    }

    #[test]
    fn request_builder() {
        let req = TransitionRequest::new(
            "wi-1",
            3,
            WorkState::Ready,
            WorkState::Running,
            "claimed",
            "worker-1",
        )
        .with_metadata(serde_json::json!({"stage": "discovery"}));
        assert_eq!(req.expected_version, 3);
        assert_eq!(req.metadata["stage"], "discovery");
    }
}
