use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stage::Stage;
use crate::state::WorkState;

/// Immutable audit record of a single state change. Append-only; the full
/// sequence for an item forms a path in the legal-transition graph ending at
/// the item's current state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    /// Unique identifier (UUID v7, time-ordered).
    pub id: String,
    /// The item this transition belongs to.
    pub work_item_id: String,
    /// State before the change.
    pub from_state: WorkState,
    /// State after the change.
    pub to_state: WorkState,
    /// Pipeline stage at the moment of the change.
    pub stage: Stage,
    /// Why the transition happened (e.g. `stage_done`, `lock_expired`,
    /// `quota_reset`, `manual_retry`).
    pub reason: String,
    /// Structured context for the change.
    pub metadata: serde_json::Value,
    /// Who applied it: a worker identity, `sweeper`, or an API caller.
    pub actor: String,
    /// When it was applied.
    pub at: DateTime<Utc>,
}

impl Transition {
    /// Build a transition record stamped `now` with a fresh v7 id.
    #[must_use]
    pub fn new(
        work_item_id: impl Into<String>,
        from_state: WorkState,
        to_state: WorkState,
        stage: Stage,
        reason: impl Into<String>,
        metadata: serde_json::Value,
        actor: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            work_item_id: work_item_id.into(),
            from_state,
            to_state,
            stage,
            reason: reason.into(),
            metadata,
            actor: actor.into(),
            at,
        }
    }
}
