use serde::{Deserialize, Serialize};

/// Position of a work item in the orchestrator state machine.
///
/// The set is closed: every persisted state is one of these variants, and
/// every state change must be an edge of the legal-transition table checked
/// by [`is_legal_transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkState {
    /// Inserted but not yet eligible for scheduling.
    Created,
    /// Eligible for a worker claim.
    Ready,
    /// A worker holds the lock and is executing the current stage.
    Running,
    /// All stages finished. Terminal.
    Completed,
    /// A stage yielded pending an external signal; `wake` resumes it.
    Waiting,
    /// The last stage attempt failed; retry policy decides what follows.
    Failed,
    /// An external-service quota was exhausted mid-pipeline; partial
    /// progress is preserved and the sweeper resumes it after reset.
    QuotaExceeded,
    /// A retry is scheduled at `next_attempt_at`.
    RetryScheduled,
    /// Parked for manual inspection; `retry` resumes it.
    Suspended,
    /// Retry budget exhausted or unrecoverable failure. Terminal.
    DeadLettered,
    /// Cancelled by the caller. Terminal.
    Cancelled,
}

impl WorkState {
    /// Every state, in declaration order.
    pub const ALL: [Self; 11] = [
        Self::Created,
        Self::Ready,
        Self::Running,
        Self::Completed,
        Self::Waiting,
        Self::Failed,
        Self::QuotaExceeded,
        Self::RetryScheduled,
        Self::Suspended,
        Self::DeadLettered,
        Self::Cancelled,
    ];

    /// Return the snake_case wire form of the state.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Waiting => "waiting",
            Self::Failed => "failed",
            Self::QuotaExceeded => "quota_exceeded",
            Self::RetryScheduled => "retry_scheduled",
            Self::Suspended => "suspended",
            Self::DeadLettered => "dead_lettered",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse the snake_case wire form back into a state.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.as_str() == s)
    }

    /// Terminal states are sinks: no outbound transitions exist.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::DeadLettered)
    }

    /// States a caller-issued `cancel` may transition directly from.
    ///
    /// `Running` items are cancelled cooperatively: the owning worker
    /// observes the cancellation request at the next stage boundary.
    #[must_use]
    pub fn is_directly_cancellable(self) -> bool {
        !self.is_terminal() && self != Self::Running
    }
}

impl std::fmt::Display for WorkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fixed legal-transition table.
///
/// This is the single source of truth for which state changes the durable
/// store may apply. A request for any edge not listed here fails with
/// `IllegalTransition` before anything is written.
#[must_use]
pub fn is_legal_transition(from: WorkState, to: WorkState) -> bool {
    use WorkState as S;
    match (from, to) {
        (S::Created, S::Ready)
        | (S::Ready, S::Running)
        // Stage advance, stage outcome edges.
        | (S::Running, S::Completed | S::Ready | S::Waiting | S::Failed | S::QuotaExceeded)
        // Cooperative cancellation at a stage boundary.
        | (S::Running, S::Cancelled)
        // Retry policy outcomes.
        | (S::Failed, S::RetryScheduled | S::Suspended | S::DeadLettered)
        // Scheduled / parked items coming back.
        | (S::RetryScheduled | S::QuotaExceeded | S::Suspended | S::Waiting, S::Ready)
        // Manual resume paths.
        | (S::Failed, S::Ready)
        // Caller cancellation from any parked, non-running state.
        | (
            S::Ready | S::RetryScheduled | S::QuotaExceeded | S::Suspended | S::Waiting | S::Failed,
            S::Cancelled,
        ) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_outbound_edges() {
        for from in WorkState::ALL {
            if from.is_terminal() {
                for to in WorkState::ALL {
                    assert!(
                        !is_legal_transition(from, to),
                        "{from} -> {to} must be illegal"
                    );
                }
            }
        }
    }

    #[test]
    fn happy_path_edges_are_legal() {
        assert!(is_legal_transition(WorkState::Created, WorkState::Ready));
        assert!(is_legal_transition(WorkState::Ready, WorkState::Running));
        assert!(is_legal_transition(WorkState::Running, WorkState::Ready));
        assert!(is_legal_transition(WorkState::Running, WorkState::Completed));
    }

    #[test]
    fn failure_edges_are_legal() {
        assert!(is_legal_transition(WorkState::Running, WorkState::Failed));
        assert!(is_legal_transition(
            WorkState::Failed,
            WorkState::RetryScheduled
        ));
        assert!(is_legal_transition(WorkState::Failed, WorkState::Suspended));
        assert!(is_legal_transition(
            WorkState::Failed,
            WorkState::DeadLettered
        ));
        assert!(is_legal_transition(
            WorkState::RetryScheduled,
            WorkState::Ready
        ));
    }

    #[test]
    fn quota_and_waiting_resume_edges() {
        assert!(is_legal_transition(
            WorkState::Running,
            WorkState::QuotaExceeded
        ));
        assert!(is_legal_transition(
            WorkState::QuotaExceeded,
            WorkState::Ready
        ));
        assert!(is_legal_transition(WorkState::Running, WorkState::Waiting));
        assert!(is_legal_transition(WorkState::Waiting, WorkState::Ready));
        assert!(is_legal_transition(WorkState::Suspended, WorkState::Ready));
    }

    #[test]
    fn illegal_edges_rejected() {
        assert!(!is_legal_transition(WorkState::Created, WorkState::Running));
        assert!(!is_legal_transition(WorkState::Ready, WorkState::Completed));
        assert!(!is_legal_transition(
            WorkState::Completed,
            WorkState::Ready
        ));
        assert!(!is_legal_transition(
            WorkState::RetryScheduled,
            WorkState::Running
        ));
        assert!(!is_legal_transition(
            WorkState::DeadLettered,
            WorkState::Ready
        ));
    }

    #[test]
    fn cancellation_reachability() {
        assert!(WorkState::Ready.is_directly_cancellable());
        assert!(WorkState::RetryScheduled.is_directly_cancellable());
        assert!(WorkState::QuotaExceeded.is_directly_cancellable());
        assert!(WorkState::Suspended.is_directly_cancellable());
        assert!(!WorkState::Running.is_directly_cancellable());
        assert!(!WorkState::Completed.is_directly_cancellable());
        assert!(!WorkState::Cancelled.is_directly_cancellable());
        // The worker-side edge still exists for cooperative cancellation.
        assert!(is_legal_transition(
            WorkState::Running,
            WorkState::Cancelled
        ));
    }

    #[test]
    fn wire_form_roundtrip() {
        for state in WorkState::ALL {
            assert_eq!(WorkState::parse(state.as_str()), Some(state));
        }
        assert_eq!(WorkState::parse("bogus"), None);
    }

    #[test]
    fn serde_snake_case() {
        let json = serde_json::to_string(&WorkState::QuotaExceeded).unwrap();
        assert_eq!(json, "\"quota_exceeded\"");
        let back: WorkState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, WorkState::QuotaExceeded);
    }
}
