use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A permanently failed item's terminal record: the error chain that led to
/// dead-lettering, most recent first. Queryable indefinitely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Unique identifier (UUID v7).
    pub id: String,
    /// The dead-lettered item.
    pub work_item_id: String,
    /// Error messages accumulated across attempts, most recent first.
    pub error_chain: Vec<String>,
    /// When the item was dead-lettered.
    pub at: DateTime<Utc>,
}

impl DeadLetterEntry {
    /// Build a dead-letter record stamped `at`.
    #[must_use]
    pub fn new(
        work_item_id: impl Into<String>,
        error_chain: Vec<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            work_item_id: work_item_id.into(),
            error_chain,
            at,
        }
    }
}
